//! How a pool creates, checks and closes its connections.

use async_trait::async_trait;
use std::future::Future;

/// Creates and manages the connections held by a [`ConnectionPool`](crate::ConnectionPool).
///
/// Only [`connect`](Self::connect) is required. The default
/// [`is_valid`](Self::is_valid) accepts every connection and the default
/// [`close`](Self::close) simply drops it.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The pooled resource.
    type Connection: Send + 'static;

    /// Opens a new connection.
    async fn connect(&self) -> anyhow::Result<Self::Connection>;

    /// Returns false if the connection should be discarded.
    async fn is_valid(&self, _conn: &mut Self::Connection) -> bool {
        true
    }

    /// Releases a connection's resources.
    async fn close(&self, _conn: Self::Connection) {}
}

type Validator<C> = Box<dyn Fn(&C) -> bool + Send + Sync>;
type Closer<C> = Box<dyn Fn(C) + Send + Sync>;

/// A [`ConnectionFactory`] assembled from closures.
///
/// ```rust
/// use herd_pool::FnFactory;
///
/// let factory = FnFactory::new(|| async { Ok::<_, anyhow::Error>(Vec::<u8>::with_capacity(64)) })
///     .with_validator(|buf: &Vec<u8>| buf.capacity() >= 64)
///     .with_closer(drop);
/// ```
pub struct FnFactory<C, F> {
    create: F,
    validator: Option<Validator<C>>,
    closer: Option<Closer<C>>,
}

impl<C, F> FnFactory<C, F> {
    /// Creates a factory that opens connections with `create`.
    pub fn new(create: F) -> Self {
        Self {
            create,
            validator: None,
            closer: None,
        }
    }

    /// Sets the liveness check.
    pub fn with_validator(mut self, validator: impl Fn(&C) -> bool + Send + Sync + 'static) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Sets the close hook.
    pub fn with_closer(mut self, closer: impl Fn(C) + Send + Sync + 'static) -> Self {
        self.closer = Some(Box::new(closer));
        self
    }
}

#[async_trait]
impl<C, F, Fut> ConnectionFactory for FnFactory<C, F>
where
    C: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<C>> + Send + 'static,
{
    type Connection = C;

    async fn connect(&self) -> anyhow::Result<C> {
        (self.create)().await
    }

    async fn is_valid(&self, conn: &mut C) -> bool {
        self.validator.as_ref().map_or(true, |validator| validator(conn))
    }

    async fn close(&self, conn: C) {
        if let Some(closer) = &self.closer {
            closer(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fn_factory_hooks() {
        let closed = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&closed);
        let factory = FnFactory::new(|| async { Ok::<u32, anyhow::Error>(7) })
            .with_validator(|conn: &u32| *conn % 2 == 1)
            .with_closer(move |_conn: u32| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let mut conn = factory.connect().await.unwrap();
        assert!(factory.is_valid(&mut conn).await);
        assert!(!factory.is_valid(&mut 8).await);

        factory.close(conn).await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_defaults_accept_everything() {
        let factory = FnFactory::new(|| async { Ok::<_, anyhow::Error>(String::from("conn")) });
        let mut conn = factory.connect().await.unwrap();
        assert!(factory.is_valid(&mut conn).await);
        factory.close(conn).await;
    }
}
