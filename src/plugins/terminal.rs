//! Terminal plugins: compose the command a human runs to attach to a
//! session. The engine surfaces the command; it never executes it.

use crate::session::RuntimeHandle;

pub trait Terminal: Send + Sync {
    fn name(&self) -> &str;

    /// argv for attaching to the session's process host.
    fn attach_command(&self, handle: &RuntimeHandle) -> Vec<String>;
}

/// Attach via the supervisor's dedicated tmux socket.
#[derive(Default)]
pub struct TmuxTerminal;

impl TmuxTerminal {
    pub fn new() -> Self {
        Self
    }
}

impl Terminal for TmuxTerminal {
    fn name(&self) -> &str {
        "tmux"
    }

    fn attach_command(&self, handle: &RuntimeHandle) -> Vec<String> {
        let socket = handle
            .data
            .get("socket")
            .and_then(|v| v.as_str())
            .unwrap_or(super::runtime::TmuxRuntime::default_socket());
        vec![
            "tmux".to_string(),
            "-L".to_string(),
            socket.to_string(),
            "attach".to_string(),
            "-t".to_string(),
            handle.id.clone(),
        ]
    }
}
