use futures::future::BoxFuture;
use std::fmt::Debug;
use tokio::time::Instant;

/// Time source for active probe intervals and passive reactivation.
///
/// Wake-ups are scheduled at absolute instants; dropping the returned future cancels the wake-up.
/// [`TokioClock`] follows tokio's clock, so a paused runtime (`tokio::time::pause`) turns it into
/// virtual time that only moves on `tokio::time::advance`.
pub trait Clock: Debug + Send + Sync {
  fn now(&self) -> Instant;

  fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
  fn now(&self) -> Instant {
    Instant::now()
  }

  fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()> {
    Box::pin(tokio::time::sleep_until(deadline))
  }
}
