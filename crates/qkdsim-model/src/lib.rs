//! # qkdsim-model
//!
//! YAML topology loading and validation for the QKD fault-telemetry pipeline.
//!
//! This crate provides:
//! - Topology schema types (nodes, links, device parameters)
//! - Loading from files and strings ([`load_topology`], [`load_topology_from_str`])
//! - Structural validation (connected chain, non-negative physics)
//! - Baseline parameter resolution per link ([`Topology::baseline_parameters`])
//! - The built-in Tokyo reference network ([`Topology::tokyo_reference`])
//!
//! The topology is read-only during a run: there are no mutation methods,
//! and fault models perturb parameters per interval without touching it.

use qkdsim_common::ParameterSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors from topology loading and validation.
///
/// All variants are fatal and abort a run before any simulation starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Duplicate node name.
    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    /// Duplicate link id.
    #[error("Duplicate link: {0}")]
    DuplicateLink(String),

    /// Link references a node that does not exist.
    #[error("Link '{link}' references unknown node '{node}'")]
    UnknownEndpoint {
        /// Offending link id.
        link: String,
        /// Missing node name.
        node: String,
    },

    /// Node lookup failed.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Link lookup failed.
    #[error("Link not found: {0}")]
    LinkNotFound(String),

    /// A physical value is outside its valid range.
    #[error("Invalid value for {field} on '{owner}': {value} ({reason})")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Node or link carrying the field.
        owner: String,
        /// Offending value.
        value: f64,
        /// Constraint that was violated.
        reason: &'static str,
    },

    /// A node is not reachable from the rest of the topology.
    #[error("Topology is not a connected chain: node '{0}' is orphaned")]
    DisconnectedNode(String),

    /// Topology has no links at all.
    #[error("Topology has no links")]
    Empty,
}

// ============================================================================
// Node and Link Types
// ============================================================================

/// Role of a node in the QKD chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Photon source endpoint (Alice side of the chain).
    Source,
    /// Detector endpoint (Bob side of the chain).
    Detector,
    /// Trusted relay forwarding keys hop by hop.
    TrustedRelay,
}

/// Cable installation type. Static metadata only: it affects assumed
/// susceptibility and noise floor, not the simulated dynamics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CableType {
    /// Aerial fiber.
    Aerial,
    /// Buried fiber.
    #[default]
    Buried,
}

/// A QKD node with its fixed device parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node name.
    pub name: String,
    /// Role in the chain.
    pub role: NodeRole,
    /// Detector quantum efficiency in [0, 1].
    pub detector_efficiency: f64,
    /// Dark counts per second.
    pub dark_count_rate: f64,
    /// Baseline back-reflection power on the source side, in watts.
    pub back_reflection_baseline: f64,
}

/// A fiber link between two nodes. Owned by the topology; read-only during
/// a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    /// Unique link id, `<from>-<to>` by default.
    pub id: String,
    /// Transmitting node name.
    pub from: String,
    /// Receiving node name.
    pub to: String,
    /// Fiber length in meters.
    pub length_m: f64,
    /// Attenuation in dB/km.
    pub attenuation_db_per_km: f64,
    /// Installation type.
    pub cable: CableType,
}

// ============================================================================
// YAML Schema (Internal)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeYaml {
    name: String,
    role: NodeRole,
    #[serde(default = "defaults::detector_efficiency")]
    detector_efficiency: f64,
    #[serde(default = "defaults::dark_count_rate")]
    dark_count_rate: f64,
    #[serde(default = "defaults::back_reflection_baseline")]
    back_reflection_baseline: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinkYaml {
    #[serde(default)]
    id: Option<String>,
    from: String,
    to: String,
    length_m: f64,
    #[serde(default = "defaults::attenuation_db_per_km")]
    attenuation_db_per_km: f64,
    #[serde(default)]
    cable: CableType,
}

/// Optics parameters shared by the whole network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OpticsDefaults {
    /// Mean photon number per signal pulse.
    pub mean_photon_number: f64,
    /// Intrinsic QBER of a healthy link.
    pub qber_floor: f64,
    /// Baseline phase error rate on the X basis.
    pub phase_error_rate: f64,
}

impl Default for OpticsDefaults {
    fn default() -> Self {
        Self {
            mean_photon_number: defaults::MEAN_PHOTON_NUMBER,
            qber_floor: defaults::QBER_FLOOR,
            phase_error_rate: defaults::PHASE_ERROR_RATE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TopologyYaml {
    #[serde(default)]
    optics: OpticsDefaults,
    nodes: Vec<NodeYaml>,
    links: Vec<LinkYaml>,
}

mod defaults {
    //! Default device parameters, matching the Tokyo QKD Network field
    //! values (Sasaki et al., 2011): SSPD detectors and SMF-28 ULL fiber.

    /// SSPD detector efficiency.
    pub const DETECTOR_EFFICIENCY: f64 = 0.80;
    /// Baseline dark counts per second.
    pub const DARK_COUNT_RATE: f64 = 100.0;
    /// Back-reflection power of a healthy source, femtowatt class.
    pub const BACK_REFLECTION_BASELINE: f64 = 1e-15;
    /// SMF-28 ULL attenuation.
    pub const ATTENUATION_DB_PER_KM: f64 = 0.2;
    /// Decoy-state signal intensity.
    pub const MEAN_PHOTON_NUMBER: f64 = 0.1;
    /// Intrinsic QBER of a healthy link.
    pub const QBER_FLOOR: f64 = 0.027;
    /// Baseline X-basis error rate.
    pub const PHASE_ERROR_RATE: f64 = 0.005;

    pub fn detector_efficiency() -> f64 {
        DETECTOR_EFFICIENCY
    }
    pub fn dark_count_rate() -> f64 {
        DARK_COUNT_RATE
    }
    pub fn back_reflection_baseline() -> f64 {
        BACK_REFLECTION_BASELINE
    }
    pub fn attenuation_db_per_km() -> f64 {
        ATTENUATION_DB_PER_KM
    }
}

// ============================================================================
// Topology
// ============================================================================

/// A validated, immutable QKD network topology.
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: BTreeMap<String, Node>,
    /// Links in declaration order; telemetry rows follow this order.
    links: Vec<Link>,
    link_index: BTreeMap<String, usize>,
    optics: OpticsDefaults,
}

impl Topology {
    /// Links in declaration order.
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// All nodes, keyed by name.
    pub fn nodes(&self) -> &BTreeMap<String, Node> {
        &self.nodes
    }

    /// Network-wide optics parameters.
    pub fn optics(&self) -> &OpticsDefaults {
        &self.optics
    }

    /// Look up a link by id.
    pub fn get_link(&self, id: &str) -> Result<&Link, ConfigError> {
        self.link_index
            .get(id)
            .map(|&i| &self.links[i])
            .ok_or_else(|| ConfigError::LinkNotFound(id.to_string()))
    }

    /// Look up a node by name.
    pub fn get_node(&self, name: &str) -> Result<&Node, ConfigError> {
        self.nodes
            .get(name)
            .ok_or_else(|| ConfigError::NodeNotFound(name.to_string()))
    }

    /// Resolve the baseline physical parameters of a link.
    ///
    /// Detector-side parameters come from the receiving node, the
    /// back-reflection baseline from the transmitting node, fiber constants
    /// from the link itself, and optics from the network defaults.
    pub fn baseline_parameters(&self, link_id: &str) -> Result<ParameterSet, ConfigError> {
        let link = self.get_link(link_id)?;
        let rx = self.get_node(&link.to)?;
        let tx = self.get_node(&link.from)?;
        Ok(ParameterSet {
            length_m: link.length_m,
            attenuation_db_per_km: link.attenuation_db_per_km,
            mean_photon_number: self.optics.mean_photon_number,
            qber_floor: self.optics.qber_floor,
            detector_efficiency: rx.detector_efficiency,
            dark_count_rate: rx.dark_count_rate,
            back_reflection_power: tx.back_reflection_baseline,
            phase_error_rate: self.optics.phase_error_rate,
            key_rate_multiplier: 1.0,
        })
    }

    /// Ids of the links incident to a node (the default `node_fail`
    /// blast radius for a trusted relay).
    pub fn links_incident(&self, node: &str) -> Vec<String> {
        self.links
            .iter()
            .filter(|l| l.from == node || l.to == node)
            .map(|l| l.id.clone())
            .collect()
    }

    /// The built-in Tokyo QKD Network reference topology: 5 nodes and
    /// 4 links, ~30.2 km total (Sasaki et al., 2011).
    pub fn tokyo_reference() -> Topology {
        load_topology_from_str(TOKYO_REFERENCE_YAML)
            .unwrap_or_else(|e| unreachable!("built-in topology must validate: {e}"))
    }
}

/// YAML source of the Tokyo reference network.
pub const TOKYO_REFERENCE_YAML: &str = "\
nodes:
  - { name: Koganei_A, role: source }
  - { name: Koganei_B, role: trusted_relay }
  - { name: Otemachi,  role: trusted_relay }
  - { name: Hakusan,   role: trusted_relay }
  - { name: Hongo,     role: detector }
links:
  - { from: Koganei_A, to: Koganei_B, length_m: 7000 }
  - { from: Koganei_B, to: Otemachi,  length_m: 13000 }
  - { from: Otemachi,  to: Hakusan,   length_m: 6000 }
  - { from: Hakusan,   to: Hongo,     length_m: 4200, cable: aerial }
";

// ============================================================================
// Loading and Validation
// ============================================================================

/// Load a topology from a YAML file.
pub fn load_topology(path: &Path) -> Result<Topology, ConfigError> {
    let yaml = std::fs::read_to_string(path)?;
    load_topology_from_str(&yaml)
}

/// Parse a topology from a YAML string.
pub fn load_topology_from_str(yaml: &str) -> Result<Topology, ConfigError> {
    let parsed: TopologyYaml = serde_yaml::from_str(yaml)?;

    let mut nodes: BTreeMap<String, Node> = BTreeMap::new();
    for n in parsed.nodes {
        if nodes.contains_key(&n.name) {
            return Err(ConfigError::DuplicateNode(n.name));
        }
        validate_unit_interval("detector_efficiency", &n.name, n.detector_efficiency)?;
        validate_non_negative("dark_count_rate", &n.name, n.dark_count_rate)?;
        validate_non_negative("back_reflection_baseline", &n.name, n.back_reflection_baseline)?;
        nodes.insert(
            n.name.clone(),
            Node {
                name: n.name,
                role: n.role,
                detector_efficiency: n.detector_efficiency,
                dark_count_rate: n.dark_count_rate,
                back_reflection_baseline: n.back_reflection_baseline,
            },
        );
    }

    let mut links = Vec::new();
    let mut link_index = BTreeMap::new();
    for l in parsed.links {
        let id = l.id.unwrap_or_else(|| format!("{}-{}", l.from, l.to));
        if link_index.contains_key(&id) {
            return Err(ConfigError::DuplicateLink(id));
        }
        for endpoint in [&l.from, &l.to] {
            if !nodes.contains_key(endpoint) {
                return Err(ConfigError::UnknownEndpoint {
                    link: id,
                    node: endpoint.clone(),
                });
            }
        }
        validate_non_negative("length_m", &id, l.length_m)?;
        validate_non_negative("attenuation_db_per_km", &id, l.attenuation_db_per_km)?;
        link_index.insert(id.clone(), links.len());
        links.push(Link {
            id,
            from: l.from,
            to: l.to,
            length_m: l.length_m,
            attenuation_db_per_km: l.attenuation_db_per_km,
            cable: l.cable,
        });
    }

    if links.is_empty() {
        return Err(ConfigError::Empty);
    }

    validate_connected(&nodes, &links)?;

    Ok(Topology {
        nodes,
        links,
        link_index,
        optics: parsed.optics,
    })
}

fn validate_non_negative(field: &'static str, owner: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::InvalidValue {
            field,
            owner: owner.to_string(),
            value,
            reason: "must be finite and non-negative",
        });
    }
    Ok(())
}

fn validate_unit_interval(field: &'static str, owner: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidValue {
            field,
            owner: owner.to_string(),
            value,
            reason: "must be within [0, 1]",
        });
    }
    Ok(())
}

/// Every node must be reachable from the first link's endpoint over the
/// undirected link graph. The rest of the pipeline assumes a connected
/// chain with no orphan nodes.
fn validate_connected(
    nodes: &BTreeMap<String, Node>,
    links: &[Link],
) -> Result<(), ConfigError> {
    let mut reachable: std::collections::BTreeSet<&str> = std::collections::BTreeSet::new();
    let mut queue = vec![links[0].from.as_str()];
    while let Some(current) = queue.pop() {
        if !reachable.insert(current) {
            continue;
        }
        for l in links {
            if l.from == current && !reachable.contains(l.to.as_str()) {
                queue.push(l.to.as_str());
            }
            if l.to == current && !reachable.contains(l.from.as_str()) {
                queue.push(l.from.as_str());
            }
        }
    }
    for name in nodes.keys() {
        if !reachable.contains(name.as_str()) {
            return Err(ConfigError::DisconnectedNode(name.clone()));
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
