//! Name-to-adapter registry.
//!
//! Venues are looked up by name at connect time; adding a venue means
//! registering a constructor here, never editing a switch in shared code.

use crate::exchange::paper::PaperVenue;
use crate::exchange::venue::VenueAdapter;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Mutex;

pub type AdapterCtor = fn() -> Box<dyn VenueAdapter>;

#[derive(Default)]
pub struct VenueRegistry {
    ctors: Mutex<HashMap<String, AdapterCtor>>,
}

impl VenueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, ctor: AdapterCtor) {
        self.ctors.lock().unwrap().insert(name.into(), ctor);
    }

    pub fn build(&self, name: &str) -> Option<Box<dyn VenueAdapter>> {
        self.ctors.lock().unwrap().get(name).map(|ctor| ctor())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ctors.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

fn make_paper() -> Box<dyn VenueAdapter> {
    Box::new(PaperVenue::new())
}

lazy_static! {
    /// Process-wide registry with the built-in venues pre-registered.
    pub static ref VENUES: VenueRegistry = {
        let registry = VenueRegistry::new();
        registry.register("paper", make_paper);
        registry
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_registered_venues_by_name() {
        assert!(VENUES.build("paper").is_some());
        assert!(VENUES.build("unknown").is_none());
        assert!(VENUES.names().contains(&"paper".to_string()));
    }
}
