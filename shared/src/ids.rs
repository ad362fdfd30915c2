use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// --- Typed IDs ---
//
// Every graph entity is keyed by a UUID assigned by the repository. The
// newtypes keep a map id from being passed where a layer id is expected.

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

typed_id!(MapId);
typed_id!(LayerId);
typed_id!(LocationId);
typed_id!(AlbumId);
typed_id!(PhotoId);
typed_id!(ItineraryId);
typed_id!(ActivityGroupId);
typed_id!(ActivityId);
typed_id!(TopListId);
typed_id!(AccoladeId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_bare_uuid() {
        let raw = Uuid::new_v4();
        let id = MapId::new(raw);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{raw}\""));
        let back: MapId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(LayerId::generate(), LayerId::generate());
    }
}
