use std::{fs::File, io, path::Path, sync::Arc};

use sha2::{Digest, Sha256};

use crate::{cache::ProcessCaches, identity::UserLookup, process::Process};

/// Fills the derived fields of a [`Process`] and keeps the shared caches warm.
#[derive(Clone)]
pub struct Enricher {
    caches: Arc<ProcessCaches>,
    users: Arc<dyn UserLookup>,
}

impl Enricher {
    pub fn new(caches: Arc<ProcessCaches>, users: Arc<dyn UserLookup>) -> Self {
        Self { caches, users }
    }

    pub fn caches(&self) -> &ProcessCaches {
        &self.caches
    }

    /// Resolve `uid`, going through the username cache. Unknown users resolve
    /// to an empty string and are looked up again next time.
    pub fn username(&self, uid: u32) -> String {
        if let Some(name) = self.caches.usernames.get(&uid) {
            return name;
        }
        match self.users.username(uid) {
            Some(name) => {
                self.caches.usernames.insert(uid, name.clone());
                name
            }
            None => String::new(),
        }
    }

    /// Record an observed process in the parents and images caches.
    pub fn observe(&self, pid: u32, ppid: u32, exe: &str) {
        self.caches.parents.insert(pid, ppid);
        if !exe.is_empty() {
            self.caches.images.insert(pid, exe.to_string());
        }
    }

    /// Complete a record whose identity fields are already set: usernames,
    /// caches, pid tree and, unless already present, the executable hash.
    pub fn complete(&self, process: &mut Process) {
        process.username = self.username(process.uid);
        process.eusername = self.username(process.euid);
        self.observe(process.pid, process.ppid, &process.exe);
        process.pid_tree = self.caches.pid_tree(process.pid);
        if process.sha256.is_empty() && !process.exe.is_empty() {
            process.sha256 = match file_sha256(&process.exe) {
                Ok(hash) => hash,
                Err(err) => {
                    log::debug!("hashing {}: {err}", process.exe);
                    String::new()
                }
            };
        }
    }
}

/// Returns `path` if it is absolute and exists, an empty string otherwise.
pub fn verified_exe(path: &str) -> String {
    let candidate = Path::new(path);
    if candidate.is_absolute() && candidate.metadata().is_ok() {
        path.to_string()
    } else {
        String::new()
    }
}

/// Hex encoded SHA-256 of a regular file.
pub fn file_sha256(path: impl AsRef<Path>) -> io::Result<String> {
    let mut file = File::open(path)?;
    if !file.metadata()?.is_file() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
    }
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
