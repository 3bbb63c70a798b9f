//! Gemeinsame Identifikationstypen fuer Tresor
//!
//! Alle IDs verwenden das Newtype-Pattern um Verwechslungen zwischen
//! verschiedenen ID-Arten zur Compilezeit auszuschliessen.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_typ {
    ($(#[$meta:meta])* $name:ident, $praefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            /// Erstellt eine neue zufaellige ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Gibt die innere UUID zurueck
            pub fn inner(&self) -> Uuid {
                self.0
            }

            /// Schluessel-Form fuer den KeyStore (nur die UUID, ohne Praefix)
            pub fn als_schluessel(&self) -> String {
                self.0.to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($praefix, ":{}"), self.0)
            }
        }
    };
}

id_typ!(
    /// Eindeutige Benutzer-ID (entspricht dem Konto auf diesem Geraet)
    UserId,
    "user"
);

id_typ!(
    /// Eindeutige Kanal-ID
    ChannelId,
    "channel"
);

id_typ!(
    /// Eindeutige Server-ID (Gruppe von Kanaelen mit gemeinsamer Mitgliedschaft)
    ServerId,
    "server"
);

id_typ!(
    /// Vom Server vergebene Nachrichten-ID
    MessageId,
    "message"
);
