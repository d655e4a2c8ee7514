// src/router.rs
//! Fixed route table keyed by the first character of the final path segment.

use crate::http::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Serve this page from the document root.
    Page(&'static str),
    /// Verify submitted credentials.
    Login,
    /// Create a user from submitted credentials.
    Register,
}

/// Pages the credential handlers send the client to.
pub mod pages {
    pub const LANDING: &str = "/judge.html";
    pub const REGISTER: &str = "/register.html";
    pub const LOGIN: &str = "/log.html";
    pub const PICTURE: &str = "/picture.html";
    pub const VIDEO: &str = "/video.html";
    pub const FANS: &str = "/fans.html";
    pub const WELCOME: &str = "/welcome.html";
    pub const LOGIN_ERROR: &str = "/logError.html";
    pub const REGISTER_ERROR: &str = "/registerError.html";
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    landing: Option<&'static str>,
    pages: Vec<(u8, &'static str)>,
    handlers: Vec<(u8, Route)>,
}

impl RouteTable {
    /// An empty table: every target is served as-is.
    pub fn empty() -> Self {
        Self {
            landing: None,
            pages: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// The server's standard page and handler markers.
    pub fn standard() -> Self {
        Self::empty()
            .landing(pages::LANDING)
            .page(b'0', pages::REGISTER)
            .page(b'1', pages::LOGIN)
            .page(b'5', pages::PICTURE)
            .page(b'6', pages::VIDEO)
            .page(b'7', pages::FANS)
            .handler(b'2', Route::Login)
            .handler(b'3', Route::Register)
    }

    pub fn landing(mut self, page: &'static str) -> Self {
        self.landing = Some(page);
        self
    }

    pub fn page(mut self, marker: u8, page: &'static str) -> Self {
        self.pages.push((marker, page));
        self
    }

    /// Handlers only match POST requests.
    pub fn handler(mut self, marker: u8, route: Route) -> Self {
        self.handlers.push((marker, route));
        self
    }

    /// Pick the route for `target`. `None` means serve the target itself.
    pub fn resolve(&self, method: Method, target: &str) -> Option<Route> {
        if target == "/" {
            return self.landing.map(Route::Page);
        }

        let segment = target.rsplit('/').next().unwrap_or_default();
        let marker = *segment.as_bytes().first()?;

        if method == Method::Post {
            if let Some((_, route)) = self.handlers.iter().find(|(m, _)| *m == marker) {
                return Some(*route);
            }
        }
        self.pages
            .iter()
            .find(|(m, _)| *m == marker)
            .map(|(_, page)| Route::Page(page))
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::standard()
    }
}
