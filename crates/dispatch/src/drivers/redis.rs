//! Redis store driver
//!
//! One multiplexed connection per pooled instance. Records are written with
//! `SET key value EX ttl`; validation is a `PING`.

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, ConnectionInfo, IntoConnectionInfo, RedisError};
use herald_pool::Context;
use secrecy::ExposeSecret;
use tracing::debug;

use crate::config::StoreConfig;
use crate::driver::{DriverError, StoreConnection, StoreDriver};

/// Opens Redis connections from a [`StoreConfig`].
#[derive(Debug, Clone)]
pub struct RedisStore {
    client: Client,
    connect_timeout: Duration,
}

impl RedisStore {
    /// Parse the endpoint and apply credentials and database.
    ///
    /// Does not connect; the pool connects on demand.
    pub fn new(config: &StoreConfig) -> Result<Self, DriverError> {
        let mut info: ConnectionInfo = config
            .endpoint
            .as_str()
            .into_connection_info()
            .map_err(|e| DriverError::protocol("invalid redis endpoint").with_source(e))?;

        if let Some(username) = &config.username {
            info.redis.username = Some(username.clone());
        }
        if let Some(password) = &config.password {
            info.redis.password = Some(password.expose_secret().to_owned());
        }
        if let Some(database) = config.database {
            info.redis.db = database;
        }

        let client = Client::open(info)
            .map_err(|e| DriverError::protocol("invalid redis connection info").with_source(e))?;
        Ok(Self {
            client,
            connect_timeout: config.connect_timeout,
        })
    }
}

impl StoreDriver for RedisStore {
    type Connection = RedisConnection;

    fn name(&self) -> &str {
        "redis"
    }

    async fn connect(&self, _ctx: &Context) -> Result<RedisConnection, DriverError> {
        let connecting = self.client.get_multiplexed_async_connection();
        match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(conn)) => {
                debug!("opened redis connection");
                Ok(RedisConnection {
                    conn,
                    ping_timeout: self.connect_timeout,
                    broken: false,
                })
            }
            Ok(Err(e)) => Err(classify(e)),
            Err(elapsed) => Err(DriverError::timeout("redis connect").with_source(elapsed)),
        }
    }
}

/// A pooled Redis connection.
pub struct RedisConnection {
    conn: MultiplexedConnection,
    /// Bounds the borrow-time PING; the pool does not time validation out
    ping_timeout: Duration,
    broken: bool,
}

impl RedisConnection {
    fn fail(&mut self, error: RedisError) -> DriverError {
        let error = classify(error);
        if error.is_connection() {
            self.broken = true;
        }
        error
    }
}

impl StoreConnection for RedisConnection {
    async fn ping(&mut self, _ctx: &Context) -> Result<(), DriverError> {
        let conn = &mut self.conn;
        let ping = async move {
            let reply: Result<String, RedisError> = ::redis::cmd("PING").query_async(conn).await;
            reply
        };
        let reply = tokio::time::timeout(self.ping_timeout, ping).await;
        match reply {
            Ok(Ok(pong)) if pong == "PONG" => Ok(()),
            Ok(Ok(other)) => Err(DriverError::protocol(format!("unexpected PING reply '{other}'"))),
            Ok(Err(e)) => Err(self.fail(e)),
            Err(elapsed) => {
                self.broken = true;
                Err(DriverError::timeout("redis ping").with_source(elapsed))
            }
        }
    }

    async fn get(&mut self, _ctx: &Context, key: &str) -> Result<Option<String>, DriverError> {
        let reply: Result<Option<String>, RedisError> =
            ::redis::cmd("GET").arg(key).query_async(&mut self.conn).await;
        reply.map_err(|e| self.fail(e))
    }

    async fn set(
        &mut self,
        _ctx: &Context,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), DriverError> {
        // EX takes whole seconds and rejects zero
        let seconds = ttl.as_secs().max(1);
        let reply: Result<(), RedisError> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(seconds)
            .query_async(&mut self.conn)
            .await;
        reply.map_err(|e| self.fail(e))
    }

    async fn del(&mut self, _ctx: &Context, key: &str) -> Result<bool, DriverError> {
        let reply: Result<i64, RedisError> =
            ::redis::cmd("DEL").arg(key).query_async(&mut self.conn).await;
        reply.map(|removed| removed > 0).map_err(|e| self.fail(e))
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

fn classify(error: RedisError) -> DriverError {
    if error.is_timeout() {
        DriverError::timeout("redis command").with_source(error)
    } else if error.is_connection_dropped()
        || error.is_connection_refusal()
        || error.is_io_error()
    {
        DriverError::connection("redis connection").with_source(error)
    } else if error.kind() == ::redis::ErrorKind::TypeError {
        DriverError::protocol("unexpected redis reply").with_source(error)
    } else {
        DriverError::rejected("redis error reply").with_source(error)
    }
}
