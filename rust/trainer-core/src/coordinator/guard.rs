//! Scoped ownership of a bridge session.

use std::sync::Arc;

use crate::bridge::Bridge;
use crate::error::{Result, TrainerError};
use crate::model::Role;

/// Guarantees `terminate` is issued exactly once for a session.
///
/// [`BridgeSession::close`] terminates explicitly. A guard dropped without
/// being closed (cancelled future, panic) schedules `terminate` on the
/// current tokio runtime instead.
pub(crate) struct BridgeSession {
    bridge: Arc<dyn Bridge>,
    role: Role,
    closed: bool,
}

impl BridgeSession {
    pub(crate) fn new(bridge: Arc<dyn Bridge>, role: Role) -> Self {
        Self {
            bridge,
            role,
            closed: false,
        }
    }

    pub(crate) fn bridge(&self) -> &dyn Bridge {
        self.bridge.as_ref()
    }

    pub(crate) async fn connect(&self) -> Result<()> {
        self.bridge
            .connect()
            .await
            .map_err(|e| TrainerError::connect(self.role, e))?;
        tracing::info!(role = %self.role, "bridge connected");
        Ok(())
    }

    pub(crate) async fn close(mut self) -> Result<()> {
        self.closed = true;
        self.bridge.terminate().await?;
        tracing::info!(role = %self.role, "bridge terminated");
        Ok(())
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        let role = self.role;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(%role, "bridge session dropped without close, terminating");
                let bridge = self.bridge.clone();
                handle.spawn(async move {
                    if let Err(e) = bridge.terminate().await {
                        tracing::warn!(%role, error = %e, "deferred terminate failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!(%role, "bridge session dropped outside a runtime, not terminated");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::LocalBridge;
    use crate::testing::{Call, RecordingBridge};
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_terminates_once() {
        let (leader, _follower) = LocalBridge::pair();
        let bridge = RecordingBridge::new(leader);

        let guard = BridgeSession::new(bridge.clone(), Role::Leader);
        guard.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(bridge.calls(), vec![Call::Terminate]);
    }

    #[tokio::test]
    async fn test_drop_schedules_terminate() {
        let (leader, _follower) = LocalBridge::pair();
        let bridge = RecordingBridge::new(leader);

        drop(BridgeSession::new(bridge.clone(), Role::Leader));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(bridge.count(&Call::Terminate), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_names_role() {
        let (leader, follower) = LocalBridge::pair();
        follower.terminate().await.unwrap();

        let guard = BridgeSession::new(Arc::new(leader), Role::Leader);
        let err = guard.connect().await.unwrap_err();
        assert!(matches!(err, TrainerError::Connect { role: Role::Leader, .. }));
        assert!(err.to_string().contains("leader"));
        assert!(matches!(
            err.root_cause(),
            TrainerError::Bridge { operation: "connect", .. }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_connect_still_terminates() {
        let (leader, _follower) = LocalBridge::pair();
        let bridge = RecordingBridge::new(leader);

        let guarded = async {
            let guard = BridgeSession::new(bridge.clone(), Role::Leader);
            // The follower never connects.
            guard.connect().await
        };
        assert!(tokio::time::timeout(Duration::from_millis(20), guarded)
            .await
            .is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(bridge.calls(), vec![Call::Connect, Call::Terminate]);
    }
}
