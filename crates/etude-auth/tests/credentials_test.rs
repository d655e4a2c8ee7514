use etude_auth::AuthConfig;
use etude_core::{LoginOutcome, RegisterOutcome, Server, ServerConfig};
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

fn auth_config(dir: &std::path::Path) -> AuthConfig {
    AuthConfig {
        store_path: dir.join("users.db"),
        store_pool: 2,
        cache_pool: 2,
    }
}

#[test]
fn test_service_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = auth_config(dir.path());

    let creds = etude_auth::open(&config).unwrap();
    assert_eq!(creds.register("ann", "pw"), RegisterOutcome::Created);
    assert_eq!(creds.register("ann", "pw"), RegisterOutcome::AlreadyExists);
    assert_eq!(creds.register("bad:name", "pw"), RegisterOutcome::Failed);
    assert_eq!(creds.login("ann", "pw").unwrap(), LoginOutcome::Accepted);
    assert_eq!(creds.login("ann", "nope").unwrap(), LoginOutcome::Rejected);
    drop(creds);

    // A fresh service sees what the first one persisted.
    let creds = etude_auth::open(&config).unwrap();
    assert_eq!(creds.login("ann", "pw").unwrap(), LoginOutcome::Accepted);
}

#[test]
fn test_login_over_http() {
    let dir = tempfile::tempdir().unwrap();
    for (name, body) in [("log.html", "log"), ("welcome.html", "welcome")] {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
    }
    fs::write(dir.path().join("users.db"), "ann:pw12\n").unwrap();

    let creds = etude_auth::open(&auth_config(dir.path())).unwrap();
    let server = Server::new(ServerConfig {
        doc_root: dir.path().to_path_buf(),
        workers: 1,
        signals: false,
        ..ServerConfig::default()
    })
    .credentials(creds)
    .start("127.0.0.1", 0)
    .unwrap();

    let body = "user=ann&password=pw12";
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    write!(
        stream,
        "POST /2CGISQL.cgi HTTP/1.1\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .unwrap();
    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(res.ends_with("welcome"));
}
