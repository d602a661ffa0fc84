use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tolerance used when comparing floating-point quantities.
pub const QUANTITY_EPSILON: f64 = 1e-9;

/// A named quantity dimension tracked per agent.
///
/// Serialized as its lowercase name so it can be used as a map key in JSON
/// and TOML (`{ cpu = 2.0, memory = 4096.0 }`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ResourceType {
    /// Compute cores.
    Cpu,
    /// Memory, conventionally in MiB.
    Memory,
    /// Accelerator units.
    Gpu,
    /// Disk or object storage.
    Storage,
    /// Network bandwidth.
    Network,
    /// LLM token budget.
    Tokens,
    /// Any other caller-defined dimension.
    Custom(String),
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Cpu => write!(f, "cpu"),
            ResourceType::Memory => write!(f, "memory"),
            ResourceType::Gpu => write!(f, "gpu"),
            ResourceType::Storage => write!(f, "storage"),
            ResourceType::Network => write!(f, "network"),
            ResourceType::Tokens => write!(f, "tokens"),
            ResourceType::Custom(name) => write!(f, "{name}"),
        }
    }
}

impl From<String> for ResourceType {
    fn from(name: String) -> Self {
        match name.to_lowercase().as_str() {
            "cpu" => ResourceType::Cpu,
            "memory" | "mem" => ResourceType::Memory,
            "gpu" => ResourceType::Gpu,
            "storage" | "disk" => ResourceType::Storage,
            "network" | "net" => ResourceType::Network,
            "tokens" | "token_budget" => ResourceType::Tokens,
            _ => ResourceType::Custom(name),
        }
    }
}

impl From<&str> for ResourceType {
    fn from(name: &str) -> Self {
        ResourceType::from(name.to_string())
    }
}

impl From<ResourceType> for String {
    fn from(resource: ResourceType) -> Self {
        resource.to_string()
    }
}

/// Quantities keyed by resource type.
///
/// Used for declared capacity, in-use amounts, task requirements and
/// committed allocation amounts alike.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceAmounts(BTreeMap<ResourceType, f64>);

impl ResourceAmounts {
    /// An empty set of amounts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion.
    pub fn with(mut self, resource: impl Into<ResourceType>, quantity: f64) -> Self {
        self.set(resource, quantity);
        self
    }

    /// Sets the quantity for a resource, replacing any previous value.
    pub fn set(&mut self, resource: impl Into<ResourceType>, quantity: f64) {
        self.0.insert(resource.into(), quantity);
    }

    /// Quantity for a resource; absent types count as zero.
    pub fn get(&self, resource: &ResourceType) -> f64 {
        self.0.get(resource).copied().unwrap_or(0.0)
    }

    /// Whether the resource type has an entry.
    pub fn contains(&self, resource: &ResourceType) -> bool {
        self.0.contains_key(resource)
    }

    /// Iterates entries in resource-type order.
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceType, f64)> {
        self.0.iter().map(|(k, v)| (k, *v))
    }

    /// The resource types present.
    pub fn resource_types(&self) -> impl Iterator<Item = &ResourceType> {
        self.0.keys()
    }

    /// Sum of every quantity.
    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    /// True when there are no entries or every quantity is zero.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| v.abs() <= QUANTITY_EPSILON)
    }

    /// Adds every entry of `other` into `self`.
    pub fn add(&mut self, other: &ResourceAmounts) {
        for (resource, quantity) in other.iter() {
            *self.0.entry(resource.clone()).or_insert(0.0) += quantity;
        }
    }

    /// Subtracts every entry of `other`, clamping at zero and dropping
    /// entries that reach zero.
    pub fn saturating_sub(&mut self, other: &ResourceAmounts) {
        for (resource, quantity) in other.iter() {
            if let Some(current) = self.0.get_mut(resource) {
                *current -= quantity;
                if *current <= QUANTITY_EPSILON {
                    self.0.remove(resource);
                }
            }
        }
    }

    /// True when every entry of `self` is at most the matching entry of `other`.
    pub fn fits_within(&self, other: &ResourceAmounts) -> bool {
        self.iter()
            .all(|(resource, quantity)| quantity <= other.get(resource) + QUANTITY_EPSILON)
    }

    /// The first entry with a negative or non-finite quantity, if any.
    pub fn first_invalid(&self) -> Option<(&ResourceType, f64)> {
        self.iter().find(|(_, q)| !q.is_finite() || *q < 0.0)
    }
}

impl<R: Into<ResourceType>> FromIterator<(R, f64)> for ResourceAmounts {
    fn from_iter<I: IntoIterator<Item = (R, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(r, q)| (r.into(), q)).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_type_names() {
        assert_eq!(ResourceType::from("CPU"), ResourceType::Cpu);
        assert_eq!(ResourceType::from("mem"), ResourceType::Memory);
        assert_eq!(
            ResourceType::from("licenses"),
            ResourceType::Custom("licenses".to_string())
        );
        assert_eq!(ResourceType::Tokens.to_string(), "tokens");
    }

    #[test]
    fn test_amounts_as_json_map() {
        let amounts = ResourceAmounts::new()
            .with(ResourceType::Cpu, 2.0)
            .with("licenses", 1.0);
        let json = serde_json::to_value(&amounts).unwrap();
        assert_eq!(json["cpu"], 2.0);
        assert_eq!(json["licenses"], 1.0);

        let parsed: ResourceAmounts = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, amounts);
    }

    #[test]
    fn test_add_and_saturating_sub() {
        let mut a = ResourceAmounts::new().with(ResourceType::Cpu, 2.0);
        a.add(&ResourceAmounts::new().with(ResourceType::Cpu, 1.5).with(ResourceType::Gpu, 1.0));
        assert_eq!(a.get(&ResourceType::Cpu), 3.5);
        assert_eq!(a.get(&ResourceType::Gpu), 1.0);

        a.saturating_sub(&ResourceAmounts::new().with(ResourceType::Gpu, 5.0));
        assert!(!a.contains(&ResourceType::Gpu));
        assert_eq!(a.total(), 3.5);
    }

    #[test]
    fn test_fits_within() {
        let need = ResourceAmounts::new().with(ResourceType::Cpu, 2.0);
        let have = ResourceAmounts::new().with(ResourceType::Cpu, 2.0).with(ResourceType::Memory, 10.0);
        assert!(need.fits_within(&have));
        assert!(!have.fits_within(&need));
    }

    #[test]
    fn test_first_invalid() {
        let amounts = ResourceAmounts::new().with(ResourceType::Cpu, -1.0);
        assert!(amounts.first_invalid().is_some());
        assert!(ResourceAmounts::new().with(ResourceType::Cpu, 1.0).first_invalid().is_none());
    }
}
