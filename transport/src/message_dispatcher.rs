use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::message::{Answer, Quest};

/// Application callbacks for a connection. Answers of a received batch are dispatched before
///  its quests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_answer(&self, answer: Answer);

    async fn on_quest(&self, quest: Quest);

    /// called once when the connection is torn down, with `by_error` set unless it was closed
    ///  through the API
    async fn on_closed(&self, by_error: bool);
}
