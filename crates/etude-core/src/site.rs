// src/site.rs
//! Request resolution: route table, credential handlers, document root.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::auth::{Credentials, LoginOutcome, RegisterOutcome};
use crate::buffer::ReadBuffer;
use crate::file::{self, Served};
use crate::http::Status;
use crate::parser::Request;
use crate::router::{Route, RouteTable, pages};

/// Form posted to the login and registration handlers.
#[derive(Debug, Deserialize)]
struct CredentialForm {
    #[serde(alias = "name")]
    user: String,
    #[serde(alias = "passwd")]
    password: String,
}

/// Everything a worker needs to turn a parsed request into a response.
#[derive(Debug, Clone)]
pub struct Site {
    doc_root: PathBuf,
    routes: RouteTable,
    credentials: Option<Credentials>,
}

impl Site {
    pub fn new(doc_root: impl Into<PathBuf>) -> Self {
        Self {
            doc_root: doc_root.into(),
            routes: RouteTable::standard(),
            credentials: None,
        }
    }

    pub fn with_routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn doc_root(&self) -> &Path {
        &self.doc_root
    }

    /// The file `target` names: the document root with the target appended
    /// verbatim. No `..` or symlink normalization happens here.
    pub fn path_for(&self, target: &str) -> PathBuf {
        let mut path = OsString::from(self.doc_root.as_os_str());
        path.push(target);
        PathBuf::from(path)
    }

    /// Resolve a complete request to the file to serve or the error to send.
    pub fn resolve(&self, req: &Request, buf: &ReadBuffer) -> Result<Served, Status> {
        let target = req.target(buf);
        let page = match self.routes.resolve(req.method, target) {
            Some(Route::Page(page)) => page,
            Some(Route::Login) if req.dynamic => self.login(req.body(buf))?,
            Some(Route::Register) if req.dynamic => self.register(req.body(buf))?,
            _ => target,
        };
        file::map_file(&self.path_for(page))
    }

    fn credentials(&self) -> Result<&Credentials, Status> {
        self.credentials.as_ref().ok_or_else(|| {
            warn!("credential route hit without a credential service");
            Status::InternalError
        })
    }

    fn login(&self, body: &[u8]) -> Result<&'static str, Status> {
        let form = parse_form(body)?;
        match self.credentials()?.login(&form.user, &form.password) {
            Ok(LoginOutcome::Accepted) => Ok(pages::WELCOME),
            Ok(LoginOutcome::Rejected) => Ok(pages::LOGIN_ERROR),
            Err(e) => {
                warn!(error = %e, "credential store lookup failed");
                Err(Status::InternalError)
            }
        }
    }

    fn register(&self, body: &[u8]) -> Result<&'static str, Status> {
        let form = parse_form(body)?;
        Ok(match self.credentials()?.register(&form.user, &form.password) {
            RegisterOutcome::Created => pages::LOGIN,
            RegisterOutcome::AlreadyExists | RegisterOutcome::Failed => pages::REGISTER_ERROR,
        })
    }
}

fn parse_form(body: &[u8]) -> Result<CredentialForm, Status> {
    serde_urlencoded::from_bytes(body).map_err(|_| Status::BadRequest)
}
