//! Users: the owners of sessions.

/// A user known to the daemon because at least one of their sessions is
/// (or recently was) around.
///
/// Users are created implicitly with their first session and collected
/// once the last session is gone, unless lingering keeps them alive.
#[derive(Debug)]
pub struct User {
    uid: u32,
    gid: u32,
    name: String,
    sessions: Vec<String>,
    runtime_dir_ready: bool,
    linger: bool,
    pub(crate) in_gc_queue: bool,
}

impl User {
    pub(crate) fn new(uid: u32, gid: u32, name: String) -> User {
        User {
            uid,
            gid,
            name,
            sessions: Vec::new(),
            runtime_dir_ready: false,
            linger: false,
            in_gc_queue: false,
        }
    }

    /// The numeric user id.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// The primary group id.
    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// The user name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ids of the user's sessions.
    pub fn sessions(&self) -> impl Iterator<Item = &str> {
        self.sessions.iter().map(String::as_str)
    }

    /// Whether any session of this user is still around.
    pub fn has_sessions(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub(crate) fn add_session(&mut self, id: &str) {
        if !self.sessions.iter().any(|s| s == id) {
            self.sessions.push(id.to_string());
        }
    }

    pub(crate) fn remove_session(&mut self, id: &str) {
        self.sessions.retain(|s| s != id);
    }

    /// Whether the per-user runtime directory has been set up.
    pub fn runtime_dir_ready(&self) -> bool {
        self.runtime_dir_ready
    }

    /// Records whether the runtime directory exists; a user with one
    /// still standing is not collected.
    pub fn set_runtime_dir_ready(&mut self, ready: bool) {
        self.runtime_dir_ready = ready;
    }

    /// Whether the user is kept alive without sessions.
    pub fn lingers(&self) -> bool {
        self.linger
    }

    pub(crate) fn set_linger(&mut self, linger: bool) {
        self.linger = linger;
    }
}
