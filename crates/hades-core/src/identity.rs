use nix::unistd::{Uid, User};

/// Resolves user names from numeric ids.
pub trait UserLookup: Send + Sync {
    fn username(&self, uid: u32) -> Option<String>;
}

/// Lookup through the system user database (`getpwuid_r`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemUsers;

impl UserLookup for SystemUsers {
    fn username(&self, uid: u32) -> Option<String> {
        match User::from_uid(Uid::from_raw(uid)) {
            Ok(user) => user.map(|user| user.name),
            Err(err) => {
                log::debug!("looking up uid {uid}: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_resolved() {
        assert_eq!(SystemUsers.username(0).as_deref(), Some("root"));
    }
}
