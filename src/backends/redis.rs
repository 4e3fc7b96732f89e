//! Redis-backed store. Keys are namespaced with a configurable prefix so
//! several plugin instances can share one database.

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client, ConnectionInfo, IntoConnectionInfo};

use crate::store::{Store, StoreError};

pub struct RedisStoreBuilder {
    connection_info: ConnectionInfo,
    prefix: String,
}

impl RedisStoreBuilder {
    pub fn new<C: IntoConnectionInfo>(connection_info: C, prefix: &str) -> Result<Self, StoreError> {
        Ok(RedisStoreBuilder {
            connection_info: connection_info
                .into_connection_info()
                .map_err(|err| StoreError(format!("invalid redis connection info: {}", err)))?,
            prefix: prefix.to_string(),
        })
    }

    pub async fn connect(&self) -> Result<RedisStore, StoreError> {
        let client = Client::open(self.connection_info.clone())
            .map_err(|err| StoreError(format!("could not open redis client: {}", err)))?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|err| StoreError(format!("could not connect to redis: {}", err)))?;
        Ok(RedisStore {
            connection,
            prefix: self.prefix.clone(),
        })
    }
}

#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    prefix: String,
}

impl RedisStore {
    fn prefixed(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut connection = self.connection.clone();
        connection
            .get::<_, Option<String>>(self.prefixed(key))
            .await
            .map_err(|err| StoreError(format!("redis GET failed: {}", err)))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        connection
            .set::<_, _, ()>(self.prefixed(key), value)
            .await
            .map_err(|err| StoreError(format!("redis SET failed: {}", err)))
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        connection
            .del::<_, ()>(self.prefixed(key))
            .await
            .map_err(|err| StoreError(format!("redis DEL failed: {}", err)))
    }
}
