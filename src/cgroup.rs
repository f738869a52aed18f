//! Seam to the external control-group classifier.
//!
//! Sessions are materialized by an authenticator which also places the
//! session leader into a control group named after the session. Resolving
//! a pid back to its session is therefore a cgroup question, answered by
//! an external component; the manager only consumes the answer through
//! [`SessionClassifier`].

/// Resolves a process id to the id of the session owning it.
pub trait SessionClassifier {
    /// Returns the session id the process belongs to, or `None` when the
    /// process is not part of any session (or the classifier failed —
    /// callers treat both the same).
    fn session_of(&self, pid: i32) -> Option<String>;
}

impl<F> SessionClassifier for F
where
    F: Fn(i32) -> Option<String>,
{
    fn session_of(&self, pid: i32) -> Option<String> {
        self(pid)
    }
}

/// Classifier used until the cgroup agent is wired up; resolves nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoClassifier;

impl SessionClassifier for NoClassifier {
    fn session_of(&self, _pid: i32) -> Option<String> {
        None
    }
}
