//! Share operations for one authenticated owner.
//!
//! Every operation takes the owner explicitly; resolving who the caller is
//! happens at the API boundary. Mutations are applied together with their
//! change notification by the store thread, so a caller that sees success
//! knows the advertisement daemon will hear about it.

use std::sync::Arc;
use shared::types::{
    AuthorizationView, NamePort, PendingNotification, RecordKey, ServiceListing, ServiceRecord,
};
use crate::catalog::Catalog;
use crate::error::Result;
use crate::friends::FriendSource;
use crate::store::db::UndeliveredFilter;
use crate::store_manager::StoreHandle;

#[derive(Clone)]
pub struct ShareService {
    store: StoreHandle,
    friends: Arc<dyn FriendSource>,
    catalog: Arc<dyn Catalog>,
}

impl ShareService {
    pub fn new(store: StoreHandle, friends: Arc<dyn FriendSource>, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            store,
            friends,
            catalog,
        }
    }

    /// Record the owner as a user of the system, making them visible in
    /// their friends' sharing lists
    pub async fn enroll(&self, owner_id: &str) -> Result<bool> {
        let new = self.store.register_user(owner_id.to_string()).await?;
        if new {
            tracing::info!("Enrolled user {}", owner_id);
        }
        Ok(new)
    }

    /// Ingest a record published by the discovery pipeline
    pub async fn register_record(&self, record: ServiceRecord) -> Result<bool> {
        let owner_id = record.owner_id.clone();
        let instance_name = record.key.instance_name.clone();
        let new = self.store.register_record(record).await?;
        if new {
            tracing::info!("Registered record {} for {}", instance_name, owner_id);
        }
        Ok(new)
    }

    pub async fn list_services(&self, owner_id: &str) -> Result<Vec<ServiceListing>> {
        let records = self.store.list_records(owner_id.to_string()).await?;
        tracing::debug!("Listing {} records for {}", records.len(), owner_id);

        Ok(records
            .into_iter()
            .map(|record| {
                let display_name = self.catalog.resolve_display_name(&record.key.service_type);
                ServiceListing { record, display_name }
            })
            .collect())
    }

    pub async fn list_hostnames(&self, owner_id: &str, service_type: &str) -> Result<Vec<String>> {
        self.store
            .list_hostnames(owner_id.to_string(), service_type.to_string())
            .await
    }

    pub async fn list_name_ports(
        &self,
        owner_id: &str,
        hostname: &str,
        service_type: &str,
    ) -> Result<Vec<NamePort>> {
        self.store
            .list_name_ports(owner_id.to_string(), hostname.to_string(), service_type.to_string())
            .await
    }

    /// Owner's known friends split by access to one record
    pub async fn get_details(&self, owner_id: &str, key: &RecordKey) -> Result<AuthorizationView> {
        let friends = self.friends.friends_of(owner_id).await?;
        self.store
            .details(owner_id.to_string(), key.clone(), friends)
            .await
    }

    /// Owner's records a friend has been granted
    pub async fn records_for_friend(&self, owner_id: &str, friend_id: &str) -> Result<Vec<RecordKey>> {
        self.store
            .records_for_friend(owner_id.to_string(), friend_id.to_string())
            .await
    }

    pub async fn digest(&self, owner_id: &str) -> Result<String> {
        self.store.digest(owner_id.to_string()).await
    }

    pub async fn authorize(
        &self,
        owner_id: &str,
        key: &RecordKey,
        friend_id: &str,
        origin: &str,
    ) -> Result<i64> {
        let id = self
            .store
            .authorize(owner_id.to_string(), key.clone(), friend_id.to_string(), origin.to_string())
            .await?;
        tracing::info!(
            "{} authorized {} on {} ({}), notification {}",
            owner_id, friend_id, key.instance_name, key.service_type, id
        );
        Ok(id)
    }

    pub async fn deauthorize(
        &self,
        owner_id: &str,
        key: &RecordKey,
        friend_id: &str,
        origin: &str,
    ) -> Result<i64> {
        let id = self
            .store
            .deauthorize(owner_id.to_string(), key.clone(), friend_id.to_string(), origin.to_string())
            .await?;
        tracing::info!(
            "{} deauthorized {} on {} ({}), notification {}",
            owner_id, friend_id, key.instance_name, key.service_type, id
        );
        Ok(id)
    }

    pub async fn delete_record(&self, owner_id: &str, key: &RecordKey, origin: &str) -> Result<i64> {
        let id = self
            .store
            .delete_record(owner_id.to_string(), key.clone(), origin.to_string())
            .await?;
        tracing::info!(
            "{} deleted {} ({}), notification {}",
            owner_id, key.instance_name, key.service_type, id
        );
        Ok(id)
    }

    pub async fn delete_all(&self, owner_id: &str, origin: &str) -> Result<Vec<i64>> {
        let ids = self
            .store
            .delete_all(owner_id.to_string(), origin.to_string())
            .await?;
        tracing::info!("{} deleted all records, {} notifications", owner_id, ids.len());
        Ok(ids)
    }

    pub async fn list_undelivered(&self, filter: UndeliveredFilter) -> Result<Vec<PendingNotification>> {
        self.store.list_undelivered(filter).await
    }

    pub async fn mark_delivered(&self, id: i64) -> Result<bool> {
        let changed = self.store.mark_delivered(id).await?;
        if changed {
            tracing::debug!("Notification {} delivered", id);
        }
        Ok(changed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use shared::types::{Friend, Transport};
    use crate::catalog::FileCatalog;
    use crate::error::Error;
    use crate::store::db::StoreDb;

    pub(crate) const OWNER: &str = "owner";
    pub(crate) const ORIGIN: &str = "2001:db8::1";

    pub(crate) struct StaticFriends(pub Vec<Friend>);

    #[async_trait]
    impl FriendSource for StaticFriends {
        async fn friends_of(&self, owner_id: &str) -> Result<Vec<Friend>> {
            if owner_id == OWNER {
                Ok(self.0.clone())
            } else {
                Ok(Vec::new())
            }
        }
    }

    pub(crate) struct DownFriends;

    #[async_trait]
    impl FriendSource for DownFriends {
        async fn friends_of(&self, _owner_id: &str) -> Result<Vec<Friend>> {
            Err(Error::friend_source("graph API timed out"))
        }
    }

    pub(crate) fn friend(id: &str) -> Friend {
        Friend {
            friend_id: id.to_string(),
            name: id.to_string(),
            picture_url: None,
        }
    }

    pub(crate) fn key(instance_name: &str) -> RecordKey {
        RecordKey {
            service_type: "_afpovertcp".to_string(),
            hostname: "nas.local.".to_string(),
            instance_name: instance_name.to_string(),
            port: 548,
            transport: Transport::Tcp,
        }
    }

    pub(crate) fn service_with(db: StoreDb, friends: Arc<dyn FriendSource>) -> ShareService {
        let catalog = FileCatalog::parse(
            r#"
            [[service]]
            service = "_afpovertcp"
            name = "AppleShare"
            "#,
        )
        .unwrap();
        ShareService::new(StoreHandle::spawn(db), friends, Arc::new(catalog))
    }

    fn service() -> ShareService {
        let friends = vec![friend("A"), friend("B"), friend("C")];
        service_with(StoreDb::open(":memory:").unwrap(), Arc::new(StaticFriends(friends)))
    }

    #[tokio::test]
    async fn test_details_scenario() {
        let service = service();
        service.register_record(ServiceRecord::new(OWNER, key("Office"))).await.unwrap();
        service.enroll("A").await.unwrap();
        service.enroll("B").await.unwrap();
        service.authorize(OWNER, &key("Office"), "A", ORIGIN).await.unwrap();

        let view = service.get_details(OWNER, &key("Office")).await.unwrap();

        assert_eq!(view.authorized_friends, vec![friend("A")]);
        assert_eq!(view.denied_friends, vec![friend("B")]);
    }

    #[tokio::test]
    async fn test_friend_source_outage_surfaces() {
        let service = service_with(StoreDb::open(":memory:").unwrap(), Arc::new(DownFriends));
        service.register_record(ServiceRecord::new(OWNER, key("Office"))).await.unwrap();

        assert!(matches!(
            service.get_details(OWNER, &key("Office")).await,
            Err(Error::FriendSourceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_owner_without_friends_gets_empty_view() {
        let service = service_with(
            StoreDb::open(":memory:").unwrap(),
            Arc::new(StaticFriends(Vec::new())),
        );
        service.register_record(ServiceRecord::new(OWNER, key("Office"))).await.unwrap();

        let view = service.get_details(OWNER, &key("Office")).await.unwrap();
        assert_eq!(view, AuthorizationView::default());
    }

    #[tokio::test]
    async fn test_list_services_attaches_display_names() {
        let service = service();
        service.register_record(ServiceRecord::new(OWNER, key("Office"))).await.unwrap();
        let mut ssh = key("shell");
        ssh.service_type = "_ssh".to_string();
        service.register_record(ServiceRecord::new(OWNER, ssh)).await.unwrap();

        let listings = service.list_services(OWNER).await.unwrap();
        let names: Vec<&str> = listings.iter().map(|l| l.display_name.as_str()).collect();
        assert_eq!(names, vec!["AppleShare", "_ssh"]);

        assert!(service.list_services("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_each_successful_mutation_queues_one_notification() {
        let service = service();
        service.register_record(ServiceRecord::new(OWNER, key("Office"))).await.unwrap();

        service.authorize(OWNER, &key("Office"), "A", ORIGIN).await.unwrap();
        service.deauthorize(OWNER, &key("Office"), "A", ORIGIN).await.unwrap();
        assert!(service.authorize(OWNER, &key("Missing"), "A", ORIGIN).await.is_err());
        service.delete_record(OWNER, &key("Office"), ORIGIN).await.unwrap();

        let pending = service.list_undelivered(UndeliveredFilter::default()).await.unwrap();
        assert_eq!(pending.len(), 3);

        for notification in &pending {
            assert!(service.mark_delivered(notification.id).await.unwrap());
        }
        assert!(!service.mark_delivered(pending[0].id).await.unwrap());
        assert!(service.list_undelivered(UndeliveredFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_all_scenario() {
        let service = service();
        for name in ["One", "Two", "Three"] {
            service.register_record(ServiceRecord::new(OWNER, key(name))).await.unwrap();
        }

        let ids = service.delete_all(OWNER, ORIGIN).await.unwrap();

        assert_eq!(ids.len(), 3);
        assert_eq!(
            service.list_undelivered(UndeliveredFilter::default()).await.unwrap().len(),
            3
        );
        assert!(service.list_services(OWNER).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_details_after_delete_is_not_found() {
        let service = service();
        service.register_record(ServiceRecord::new(OWNER, key("Office"))).await.unwrap();
        service.enroll("A").await.unwrap();
        service.authorize(OWNER, &key("Office"), "A", ORIGIN).await.unwrap();

        service.delete_record(OWNER, &key("Office"), ORIGIN).await.unwrap();

        assert!(matches!(
            service.get_details(OWNER, &key("Office")).await,
            Err(Error::NotFound)
        ));
        assert!(service.records_for_friend(OWNER, "A").await.unwrap().is_empty());
    }
}
