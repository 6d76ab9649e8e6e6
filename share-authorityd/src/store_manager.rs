use std::thread;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use shared::types::{
    AuthorizationView, Friend, NamePort, PendingNotification, RecordKey, ServiceRecord,
};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::store::db::{StoreDb, UndeliveredFilter};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Commands sent to the store thread
pub enum StoreCommand {
    RegisterUser(String, Reply<bool>),
    RegisterRecord(ServiceRecord, Reply<bool>),
    ListRecords(String, Reply<Vec<ServiceRecord>>),
    ListHostnames {
        owner_id: String,
        service_type: String,
        reply: Reply<Vec<String>>,
    },
    ListNamePorts {
        owner_id: String,
        hostname: String,
        service_type: String,
        reply: Reply<Vec<NamePort>>,
    },
    Details {
        owner_id: String,
        key: RecordKey,
        friends: Vec<Friend>,
        reply: Reply<AuthorizationView>,
    },
    RecordsForFriend {
        owner_id: String,
        friend_id: String,
        reply: Reply<Vec<RecordKey>>,
    },
    Digest(String, Reply<String>),
    Authorize {
        owner_id: String,
        key: RecordKey,
        friend_id: String,
        origin: String,
        reply: Reply<i64>,
    },
    Deauthorize {
        owner_id: String,
        key: RecordKey,
        friend_id: String,
        origin: String,
        reply: Reply<i64>,
    },
    DeleteRecord {
        owner_id: String,
        key: RecordKey,
        origin: String,
        reply: Reply<i64>,
    },
    DeleteAll {
        owner_id: String,
        origin: String,
        reply: Reply<Vec<i64>>,
    },
    ListUndelivered(UndeliveredFilter, Reply<Vec<PendingNotification>>),
    CountUndelivered(Reply<u64>),
    MarkDelivered(i64, Reply<bool>),
    Maintenance {
        retention_secs: u64,
        reply: Reply<u64>,
    },
    Shutdown,
}

/// Handle to interact with the store database. Every command is executed in
/// order on one thread, so concurrent requests never interleave inside a
/// transaction.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn a new store thread with the given database
    pub fn spawn(mut db: StoreDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::RegisterUser(user_id, reply) => {
                        let _ = reply.send(db.register_user(&user_id));
                    }
                    StoreCommand::RegisterRecord(record, reply) => {
                        let _ = reply.send(db.register_record(&record));
                    }
                    StoreCommand::ListRecords(owner_id, reply) => {
                        let _ = reply.send(db.list_records(&owner_id));
                    }
                    StoreCommand::ListHostnames { owner_id, service_type, reply } => {
                        let _ = reply.send(db.list_hostnames(&owner_id, &service_type));
                    }
                    StoreCommand::ListNamePorts { owner_id, hostname, service_type, reply } => {
                        let _ = reply.send(db.list_name_ports(&owner_id, &hostname, &service_type));
                    }
                    StoreCommand::Details { owner_id, key, friends, reply } => {
                        let _ = reply.send(db.authorization_view(&owner_id, &key, friends));
                    }
                    StoreCommand::RecordsForFriend { owner_id, friend_id, reply } => {
                        let _ = reply.send(db.records_for_friend(&owner_id, &friend_id));
                    }
                    StoreCommand::Digest(owner_id, reply) => {
                        let _ = reply.send(db.owner_digest(&owner_id));
                    }
                    StoreCommand::Authorize { owner_id, key, friend_id, origin, reply } => {
                        let _ = reply.send(db.authorize(&owner_id, &key, &friend_id, &origin));
                    }
                    StoreCommand::Deauthorize { owner_id, key, friend_id, origin, reply } => {
                        let _ = reply.send(db.deauthorize(&owner_id, &key, &friend_id, &origin));
                    }
                    StoreCommand::DeleteRecord { owner_id, key, origin, reply } => {
                        let _ = reply.send(db.delete_record(&owner_id, &key, &origin));
                    }
                    StoreCommand::DeleteAll { owner_id, origin, reply } => {
                        let _ = reply.send(db.delete_all(&owner_id, &origin));
                    }
                    StoreCommand::ListUndelivered(filter, reply) => {
                        let _ = reply.send(db.list_undelivered(&filter));
                    }
                    StoreCommand::CountUndelivered(reply) => {
                        let _ = reply.send(db.count_undelivered());
                    }
                    StoreCommand::MarkDelivered(id, reply) => {
                        let _ = reply.send(db.mark_delivered(id));
                    }
                    StoreCommand::Maintenance { retention_secs, reply } => {
                        let _ = reply.send(db.prune_delivered(retention_secs));
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> StoreCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await?;
        rx.await?
    }

    pub async fn register_user(&self, user_id: String) -> Result<bool> {
        self.request(|reply| StoreCommand::RegisterUser(user_id, reply)).await
    }

    pub async fn register_record(&self, record: ServiceRecord) -> Result<bool> {
        self.request(|reply| StoreCommand::RegisterRecord(record, reply)).await
    }

    pub async fn list_records(&self, owner_id: String) -> Result<Vec<ServiceRecord>> {
        self.request(|reply| StoreCommand::ListRecords(owner_id, reply)).await
    }

    pub async fn list_hostnames(&self, owner_id: String, service_type: String) -> Result<Vec<String>> {
        self.request(|reply| StoreCommand::ListHostnames { owner_id, service_type, reply })
            .await
    }

    pub async fn list_name_ports(
        &self,
        owner_id: String,
        hostname: String,
        service_type: String,
    ) -> Result<Vec<NamePort>> {
        self.request(|reply| StoreCommand::ListNamePorts {
            owner_id,
            hostname,
            service_type,
            reply,
        })
        .await
    }

    pub async fn details(
        &self,
        owner_id: String,
        key: RecordKey,
        friends: Vec<Friend>,
    ) -> Result<AuthorizationView> {
        self.request(|reply| StoreCommand::Details { owner_id, key, friends, reply })
            .await
    }

    pub async fn records_for_friend(&self, owner_id: String, friend_id: String) -> Result<Vec<RecordKey>> {
        self.request(|reply| StoreCommand::RecordsForFriend { owner_id, friend_id, reply })
            .await
    }

    pub async fn digest(&self, owner_id: String) -> Result<String> {
        self.request(|reply| StoreCommand::Digest(owner_id, reply)).await
    }

    pub async fn authorize(
        &self,
        owner_id: String,
        key: RecordKey,
        friend_id: String,
        origin: String,
    ) -> Result<i64> {
        self.request(|reply| StoreCommand::Authorize { owner_id, key, friend_id, origin, reply })
            .await
    }

    pub async fn deauthorize(
        &self,
        owner_id: String,
        key: RecordKey,
        friend_id: String,
        origin: String,
    ) -> Result<i64> {
        self.request(|reply| StoreCommand::Deauthorize { owner_id, key, friend_id, origin, reply })
            .await
    }

    pub async fn delete_record(&self, owner_id: String, key: RecordKey, origin: String) -> Result<i64> {
        self.request(|reply| StoreCommand::DeleteRecord { owner_id, key, origin, reply })
            .await
    }

    pub async fn delete_all(&self, owner_id: String, origin: String) -> Result<Vec<i64>> {
        self.request(|reply| StoreCommand::DeleteAll { owner_id, origin, reply })
            .await
    }

    pub async fn list_undelivered(&self, filter: UndeliveredFilter) -> Result<Vec<PendingNotification>> {
        self.request(|reply| StoreCommand::ListUndelivered(filter, reply)).await
    }

    pub async fn count_undelivered(&self) -> Result<u64> {
        self.request(StoreCommand::CountUndelivered).await
    }

    pub async fn mark_delivered(&self, id: i64) -> Result<bool> {
        self.request(|reply| StoreCommand::MarkDelivered(id, reply)).await
    }

    /// Prune delivered notifications older than the retention window
    pub async fn maintenance(&self, retention_secs: u64) -> Result<u64> {
        self.request(|reply| StoreCommand::Maintenance { retention_secs, reply })
            .await
    }

    /// Shutdown the store thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(StoreCommand::Shutdown).await?;
        Ok(())
    }
}

/// Store maintenance loop - prunes delivered notifications on an interval
pub async fn run(store: StoreHandle, config: StoreConfig, cancel: CancellationToken) -> Result<()> {
    if config.maintenance_interval_secs == 0 {
        tracing::error!("Store maintenance disabled: maintenance_interval_secs is zero");
        return Ok(());
    }

    let mut maintenance_interval = tokio::time::interval(
        std::time::Duration::from_secs(config.maintenance_interval_secs)
    );

    loop {
        tokio::select! {
            _ = maintenance_interval.tick() => {
                match store.maintenance(config.delivered_retention_secs).await {
                    Ok(0) => {}
                    Ok(pruned) => tracing::info!("Pruned {} delivered notifications", pruned),
                    Err(e) => tracing::error!("Failed to run maintenance: {}", e),
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Store maintenance shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::Transport;
    use crate::error::Error;

    fn key() -> RecordKey {
        RecordKey {
            service_type: "_ssh".to_string(),
            hostname: "box.local.".to_string(),
            instance_name: "box".to_string(),
            port: 22,
            transport: Transport::Tcp,
        }
    }

    #[tokio::test]
    async fn test_handle_round_trips_commands() {
        let store = StoreHandle::spawn(StoreDb::open(":memory:").unwrap());

        assert!(store
            .register_record(ServiceRecord::new("owner", key()))
            .await
            .unwrap());
        let id = store
            .authorize("owner".into(), key(), "friend".into(), "::1".into())
            .await
            .unwrap();

        let pending = store.list_undelivered(UndeliveredFilter::default()).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);

        assert!(store.mark_delivered(id).await.unwrap());
        assert!(store.list_undelivered(UndeliveredFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_grants_serialize() {
        let store = StoreHandle::spawn(StoreDb::open(":memory:").unwrap());
        store
            .register_record(ServiceRecord::new("owner", key()))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .authorize("owner".into(), key(), format!("friend-{}", i % 4), "::1".into())
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let pending = store.list_undelivered(UndeliveredFilter::default()).await.unwrap();
        assert_eq!(pending.len(), 16);
        let mut ids: Vec<i64> = pending.iter().map(|n| n.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 16);
    }

    #[tokio::test]
    async fn test_shutdown_makes_store_unavailable() {
        let store = StoreHandle::spawn(StoreDb::open(":memory:").unwrap());
        store.shutdown().await.unwrap();

        assert!(matches!(
            store.list_records("owner".into()).await,
            Err(Error::StoreUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_store_survives_out_of_range_retention() {
        let store = StoreHandle::spawn(StoreDb::open(":memory:").unwrap());
        store
            .register_record(ServiceRecord::new("owner", key()))
            .await
            .unwrap();
        let id = store
            .authorize("owner".into(), key(), "friend".into(), "::1".into())
            .await
            .unwrap();
        store.mark_delivered(id).await.unwrap();

        assert_eq!(store.maintenance(u64::MAX).await.unwrap(), 0);
        assert_eq!(store.maintenance(10_000_000_000_000_000).await.unwrap(), 0);

        store
            .authorize("owner".into(), key(), "friend".into(), "::1".into())
            .await
            .unwrap();
        assert_eq!(store.count_undelivered().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_maintenance_returns() {
        let store = StoreHandle::spawn(StoreDb::open(":memory:").unwrap());
        let config = StoreConfig {
            maintenance_interval_secs: 0,
            ..StoreConfig::default()
        };

        run(store.clone(), config, CancellationToken::new()).await.unwrap();
        assert_eq!(store.count_undelivered().await.unwrap(), 0);
    }
}
