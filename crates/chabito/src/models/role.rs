use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Author of a message in a conversation
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    Human,
    Assistant,
    Tool,
}
