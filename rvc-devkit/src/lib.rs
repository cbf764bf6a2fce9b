/*!
# RVC DevKit - Doublures et utilitaires de test pour le pont Matter

Bibliothèque facilitant les tests du kernel avec:
- Faux serveur Matter WebSocket (enregistre les trames, pousse des trames)
- Constructeurs de trames snapshot/status/ack
- Helpers d'attente et d'initialisation des logs
*/

pub mod frame_helpers;
pub mod matter_stub;
pub mod test_utils;

pub use frame_helpers::{FrameBuilder, NodeBuilder};
pub use matter_stub::MockMatterServer;
pub use test_utils::{assert_field_equals, field, init_logging, wait_until};
