// Registration and profile lookup over an injected store and id generator

use crate::config::Config;
use crate::link::{self, ProfileCode};
use crate::models::{FarmerRecord, RegistrationForm};
use crate::store::Store;
use crate::ufi::IdGenerator;
use eyre::{Result, eyre};
use tracing::{info, warn};

/// Outcome of a successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub record: FarmerRecord,
    pub profile_url: String,
}

impl Registration {
    pub fn id(&self) -> &str {
        &self.record.id
    }
}

/// Result of looking up a profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Profile {
    Found(FarmerRecord),
    /// Lookup missed and the fixed placeholder stands in
    Placeholder(FarmerRecord),
    NotFound,
}

impl Profile {
    /// The record to display, if any
    pub fn record(&self) -> Option<&FarmerRecord> {
        match self {
            Profile::Found(record) | Profile::Placeholder(record) => Some(record),
            Profile::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Profile::Found(_))
    }
}

pub struct Registry<G: IdGenerator> {
    store: Store<FarmerRecord>,
    ids: G,
    origin: String,
    max_id_attempts: u32,
    placeholder_on_miss: bool,
}

impl<G: IdGenerator> Registry<G> {
    pub fn new(store: Store<FarmerRecord>, ids: G, config: &Config) -> Self {
        Self {
            store,
            ids,
            origin: config.origin.clone(),
            max_id_attempts: config.max_id_attempts.max(1),
            placeholder_on_miss: config.placeholder_on_miss,
        }
    }

    pub fn store(&mut self) -> &mut Store<FarmerRecord> {
        &mut self.store
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Assign a fresh UFI to the form and append the record
    ///
    /// The identifier is checked against the latest sequence under the
    /// store's append lock and regenerated on collision.
    pub fn register(&mut self, form: RegistrationForm) -> Result<Registration> {
        form.validate()?;

        let ids = &self.ids;
        let max_attempts = self.max_id_attempts;

        let record = self.store.append_with(|existing| {
            let id = unused_id(ids, existing, max_attempts)?;
            Ok(form.into_record(id))
        })?;

        info!(id = %record.id, "Registered farmer");

        Ok(Registration {
            profile_url: link::profile_url(&self.origin, &record.id),
            record,
        })
    }

    /// Look up a profile, standing in the placeholder on a miss when configured to
    pub fn profile(&mut self, id: &str) -> Result<Profile> {
        self.profile_with(id, self.placeholder_on_miss)
    }

    pub fn profile_with(&mut self, id: &str, placeholder_on_miss: bool) -> Result<Profile> {
        match self.store.find_by_id(id)? {
            Some(record) => Ok(Profile::Found(record)),
            None if placeholder_on_miss => Ok(Profile::Placeholder(FarmerRecord::placeholder())),
            None => Ok(Profile::NotFound),
        }
    }

    /// Scannable code for the profile link of `id`
    pub fn profile_code(&self, id: &str) -> Result<ProfileCode> {
        ProfileCode::new(&self.origin, id)
    }
}

fn unused_id<G: IdGenerator>(ids: &G, existing: &[FarmerRecord], max_attempts: u32) -> Result<String> {
    for attempt in 1..=max_attempts {
        let id = ids.generate()?;
        if !existing.iter().any(|r| r.id == id) {
            return Ok(id);
        }
        warn!(id = %id, attempt, "Generated UFI already registered, retrying");
    }

    Err(eyre!(
        "Could not find an unused UFI after {} attempts ({} farmers registered)",
        max_attempts,
        existing.len()
    ))
}
