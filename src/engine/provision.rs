//! Seed/admin path: creates resource and holder rows. Reservation logic never
//! calls into here.

use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{append_event, Engine, EngineError};

impl Engine {
    pub async fn create_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        description: Option<String>,
        stock: u32,
    ) -> Result<ResourceInfo, EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        if let Some(ref d) = description
            && d.len() > MAX_DESCRIPTION_LEN
        {
            return Err(EngineError::LimitExceeded("resource description too long"));
        }
        if stock > MAX_STOCK {
            return Err(EngineError::LimitExceeded("stock too large"));
        }

        let _catalog = self.catalog_lock.lock().await;
        if self.store.resource_count() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.store.contains_resource(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ResourceCreated {
            id,
            name: name.clone(),
            description: description.clone(),
            stock,
        };
        append_event(&self.wal_tx, &event).await?;
        let rs = ResourceState::new(id, name, description, stock);
        let info = rs.info();
        self.store.insert_resource(rs);
        info!("resource {id} provisioned with stock {stock}");
        Ok(info)
    }

    pub async fn create_holder(&self, id: Ulid, contact: String) -> Result<HolderInfo, EngineError> {
        let contact = contact.trim().to_string();
        if contact.is_empty() {
            return Err(EngineError::LimitExceeded("holder contact is empty"));
        }
        if contact.len() > MAX_CONTACT_LEN {
            return Err(EngineError::LimitExceeded("holder contact too long"));
        }
        // Holder references that parse as a ULID are resolved as ids
        if Ulid::from_string(&contact).is_ok() {
            return Err(EngineError::InvalidContact(contact));
        }

        let _catalog = self.catalog_lock.lock().await;
        if self.store.holder_count() >= MAX_HOLDERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many holders"));
        }
        if self.store.contains_holder(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.store.holder_for_contact(&contact).is_some() {
            return Err(EngineError::DuplicateContact(contact));
        }

        let event = Event::HolderCreated {
            id,
            contact: contact.clone(),
        };
        append_event(&self.wal_tx, &event).await?;
        let holder = HolderState::new(id, contact);
        let info = holder.info();
        self.store.insert_holder(holder);
        info!("holder {id} provisioned");
        Ok(info)
    }
}
