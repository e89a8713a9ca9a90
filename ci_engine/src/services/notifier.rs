//! Notification collaborator interface.

use async_trait::async_trait;

use crate::events::build_set::BuildSetNotice;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// First failing child while the build set is still pending.
    async fn first_failure(&self, notice: &BuildSetNotice);

    /// Every child is terminal; `notice.status` is final.
    async fn finished(&self, notice: &BuildSetNotice);
}
