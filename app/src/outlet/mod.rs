use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
#[serde(transparent)]
pub struct ChannelId(u32);

impl ChannelId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum OutletType {
    #[display("electric")]
    Electric,
    #[display("hydraulic")]
    Hydraulic,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutletSpec {
    pub internal_name: String,
    #[serde(rename = "type")]
    pub outlet_type: OutletType,
    pub channel: ChannelId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutletState {
    #[display("ON")]
    On,
    #[display("OFF")]
    Off,
}

pub fn capabilities(outlets: &[OutletSpec]) -> BTreeMap<OutletType, BTreeMap<ChannelId, String>> {
    let mut result: BTreeMap<OutletType, BTreeMap<ChannelId, String>> = BTreeMap::new();

    for outlet in outlets {
        result
            .entry(outlet.outlet_type)
            .or_default()
            .insert(outlet.channel, outlet.internal_name.clone());
    }

    result
}
