use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

/// Per-invocation cancellation scope derived from the process-wide root token.
///
/// With a deadline the scope cancels itself at that instant. Without one it can still be cancelled
/// through the root token. Dropping the scope cancels it, whichever path the invocation took.
pub(crate) struct InvocationScope {
    token: CancellationToken,
}

impl InvocationScope {
    pub(crate) fn derive(root: &CancellationToken, deadline: Option<SystemTime>) -> Self {
        let token = root.child_token();

        if let Some(deadline) = deadline {
            let remaining = deadline
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);
            // Deadlines too far out to represent behave like no deadline at all.
            if let Some(at) = tokio::time::Instant::now().checked_add(remaining) {
                let timer = token.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => timer.cancel(),
                        _ = timer.cancelled() => {}
                    }
                });
            }
        }

        Self { token }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for InvocationScope {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
