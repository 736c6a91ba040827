//! connpool
//!
//! A bounded pool of reusable connections to one remote endpoint. The pool
//! enforces two independent limits: how many idle connections are kept for
//! reuse, and how many connections may be open at once.
//!
//! ```no_run
//! # async fn demo() -> Result<(), connpool::PoolError> {
//! use connpool::{Network, Pool};
//!
//! let pool = Pool::new(Network::Tcp, "127.0.0.1:6379");
//! pool.set_max_open_conns(8);
//!
//! let mut conn = pool.get().await?;
//! // ... talk to the server through `conn` ...
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod conn;
pub mod dialer;
pub mod error;
pub mod pool;

pub use config::{ConfigError, PoolConfig};
pub use conn::PooledConn;
pub use connpool_core::{Context, ContextError, Endpoint, Network};
pub use dialer::{Dialer, NetDialer, NetStream};
pub use error::PoolError;
pub use pool::{Pool, PoolStats, SharedPool, DEFAULT_MAX_IDLE_CONNS};
