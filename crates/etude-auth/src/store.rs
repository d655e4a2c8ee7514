//! File-backed credential store.
//!
//! One `name:password` record per line. The file is indexed in memory at
//! open; registrations append through a pool of append handles. A record
//! counts only once its newline is on disk.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use etude_core::sync::Locker;
use etude_core::{CredentialError, CredentialStore, Insert, Lookup};
use tracing::{debug, info, warn};

use crate::pool::ConnectionPool;

pub struct FileStore {
    users: Locker<HashMap<String, String>>,
    appenders: ConnectionPool<File>,
}

impl FileStore {
    /// Open (creating if needed) the store at `path` with `pool_size` append handles.
    pub fn open(path: impl AsRef<Path>, pool_size: usize) -> Result<Self, CredentialError> {
        let path = path.as_ref().to_path_buf();
        let appenders = ConnectionPool::connect("credential-store", pool_size, |_| {
            Ok(OpenOptions::new().create(true).append(true).open(&path)?)
        })?;

        let mut text = String::new();
        File::open(&path)?.read_to_string(&mut text)?;
        let committed = text.rfind('\n').map_or(0, |i| i + 1);
        if committed < text.len() {
            warn!(
                path = %path.display(),
                bytes = text.len() - committed,
                "discarding unterminated record"
            );
            OpenOptions::new()
                .write(true)
                .open(&path)?
                .set_len(committed as u64)?;
            text.truncate(committed);
        }
        let users = parse_records(&text)?;
        info!(path = %path.display(), users = users.len(), "credential store loaded");

        Ok(Self {
            users: Locker::new(users),
            appenders,
        })
    }

    pub fn len(&self) -> usize {
        self.users.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_records(text: &str) -> Result<HashMap<String, String>, CredentialError> {
    let mut users = HashMap::new();
    for (i, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let (name, passwd) = line
            .split_once(':')
            .ok_or(CredentialError::Malformed { line: i + 1 })?;
        if name.is_empty() {
            return Err(CredentialError::Malformed { line: i + 1 });
        }
        // First registration of a name wins.
        users
            .entry(name.to_string())
            .or_insert_with(|| passwd.to_string());
    }
    Ok(users)
}

/// Append one record, truncating back to the previous end if the write fails.
/// Callers hold the index lock, so no other append can interleave.
fn append_record(file: &mut File, name: &str, passwd: &str) -> io::Result<()> {
    let end = file.metadata()?.len();
    let record = format!("{name}:{passwd}\n");
    if let Err(e) = file.write_all(record.as_bytes()).and_then(|()| file.flush()) {
        if let Err(undo) = file.set_len(end) {
            warn!(error = %undo, "partial record left in credential store");
        }
        return Err(e);
    }
    Ok(())
}

fn valid_field(s: &str) -> bool {
    !s.contains(['\n', '\r'])
}

impl CredentialStore for FileStore {
    fn lookup(&self, name: &str, passwd: &str) -> Result<Lookup, CredentialError> {
        Ok(match self.users.lock().get(name) {
            Some(stored) if stored == passwd => Lookup::Found,
            _ => Lookup::NotFound,
        })
    }

    fn register(&self, name: &str, passwd: &str) -> Result<Insert, CredentialError> {
        if name.is_empty() || name.contains(':') || !valid_field(name) || !valid_field(passwd) {
            return Err(CredentialError::InvalidName);
        }

        if self.users.lock().contains_key(name) {
            return Ok(Insert::Exists);
        }
        // Wait for a handle without holding the index.
        let mut file = self.appenders.acquire()?;
        let mut users = self.users.lock();
        if users.contains_key(name) {
            return Ok(Insert::Exists);
        }
        append_record(&mut file, name, passwd)?;
        users.insert(name.to_string(), passwd.to_string());
        debug!(user = name, "user registered");
        Ok(Insert::Inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Arc, mpsc};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn registrations_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.db");

        let store = FileStore::open(&path, 2).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.register("ann", "pw").unwrap(), Insert::Inserted);
        assert_eq!(store.register("ann", "other").unwrap(), Insert::Exists);
        assert_eq!(store.lookup("ann", "pw").unwrap(), Lookup::Found);
        assert_eq!(store.lookup("ann", "other").unwrap(), Lookup::NotFound);
        drop(store);

        assert_eq!(fs::read_to_string(&path).unwrap(), "ann:pw\n");
        let reopened = FileStore::open(&path, 1).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.lookup("ann", "pw").unwrap(), Lookup::Found);
    }

    #[test]
    fn unterminated_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.db");
        fs::write(&path, "ann:pw\nbo").unwrap();

        let store = FileStore::open(&path, 1).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), "ann:pw\n");

        assert_eq!(store.register("bob", "pw2").unwrap(), Insert::Inserted);
        drop(store);
        assert_eq!(fs::read_to_string(&path).unwrap(), "ann:pw\nbob:pw2\n");
        assert_eq!(FileStore::open(&path, 1).unwrap().len(), 2);
    }

    #[test]
    fn lookups_proceed_while_registration_waits_for_a_handle() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path().join("users.db"), 1).unwrap());
        store.register("ann", "pw").unwrap();
        let held = store.appenders.acquire().unwrap();

        let writer = {
            let store = store.clone();
            thread::spawn(move || store.register("bob", "pw"))
        };
        thread::sleep(Duration::from_millis(50));

        let (tx, rx) = mpsc::channel();
        let reader = store.clone();
        thread::spawn(move || {
            let _ = tx.send(reader.lookup("ann", "pw"));
        });
        let found = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("lookup blocked behind a pending registration");
        assert_eq!(found.unwrap(), Lookup::Found);
        assert!(!writer.is_finished());

        drop(held);
        assert_eq!(writer.join().unwrap().unwrap(), Insert::Inserted);
        assert_eq!(store.lookup("bob", "pw").unwrap(), Lookup::Found);
    }

    #[test]
    fn concurrent_registrations_all_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.db");
        let store = Arc::new(FileStore::open(&path, 2).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || store.register(&format!("user{i}"), "pw").unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Insert::Inserted);
        }
        drop(store);

        let reopened = FileStore::open(&path, 1).unwrap();
        assert_eq!(reopened.len(), 8);
        assert_eq!(reopened.lookup("user7", "pw").unwrap(), Lookup::Found);
    }

    #[test]
    fn passwords_may_contain_colons() {
        let users = parse_records("bob:a:b\n\ncarol:\n").unwrap();
        assert_eq!(users["bob"], "a:b");
        assert_eq!(users["carol"], "");
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            parse_records("ok:1\nbroken\n"),
            Err(CredentialError::Malformed { line: 2 })
        ));

        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("users.db"), 1).unwrap();
        assert!(matches!(store.register("a:b", "pw"), Err(CredentialError::InvalidName)));
        assert!(matches!(store.register("a\nb", "pw"), Err(CredentialError::InvalidName)));
        assert!(matches!(store.register("", "pw"), Err(CredentialError::InvalidName)));
        assert!(store.is_empty());
    }

    #[test]
    fn zero_sized_pool_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FileStore::open(dir.path().join("users.db"), 0),
            Err(CredentialError::PoolInit(..))
        ));
    }
}
