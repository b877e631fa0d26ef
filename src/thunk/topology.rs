//! Topology input consumed by the memory manager.
//!
//! Discovery itself happens elsewhere; callers describe every node with a
//! [`NodeInfo`] and the manager derives its aperture layout from that.

use std::env;

pub const GFX_VERSION_VEGA10: u32 = 90000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub stepping: u32,
}

impl EngineVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32, stepping: u32) -> Self {
        Self {
            major,
            minor,
            stepping,
        }
    }

    /// Full GFX version, e.g. `90010` for gfx90a.
    #[must_use]
    pub const fn gfx_version(self) -> u32 {
        self.major * 10000 + self.minor * 100 + self.stepping
    }

    /// Applies `HSA_OVERRIDE_GFX_VERSION_<node>` or `HSA_OVERRIDE_GFX_VERSION`
    /// (`major.minor.stepping`) when set.
    #[must_use]
    pub fn with_env_override(self, node_id: u32) -> Self {
        let value = env::var(format!("HSA_OVERRIDE_GFX_VERSION_{node_id}"))
            .or_else(|_| env::var("HSA_OVERRIDE_GFX_VERSION"));
        match value {
            Ok(v) => Self::parse(&v).unwrap_or(self),
            Err(_) => self,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.trim().split('.').collect();
        if parts.len() == 3
            && let (Ok(major), Ok(minor), Ok(stepping)) = (
                parts[0].parse::<u32>(),
                parts[1].parse::<u32>(),
                parts[2].parse::<u32>(),
            )
        {
            return Some(Self::new(major, minor, stepping));
        }
        None
    }
}

/// One topology node as the memory manager sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: u32,
    /// Driver GPU id; zero for CPU-only nodes.
    pub gpu_id: u32,
    pub device_id: u32,
    pub local_mem_size: u64,
    pub engine: EngineVersion,
    pub drm_render_minor: u32,
    pub cpu_cores: u32,
    pub simd_count: u32,
    /// Nodes this node has an IO link to.
    pub io_links: Vec<u32>,
}

impl NodeInfo {
    #[must_use]
    pub const fn is_gpu(&self) -> bool {
        self.gpu_id != 0
    }
}

/// Discrete GPUs have compute units but no CPU cores of their own.
#[must_use]
pub fn is_dgpu(nodes: &[NodeInfo]) -> bool {
    nodes
        .iter()
        .any(|n| n.simd_count > 0 && n.cpu_cores == 0)
}

/// Whether a GPU addresses memory through the shared SVM window.
#[must_use]
pub const fn is_svm_needed(is_dgpu: bool, engine: EngineVersion) -> bool {
    is_dgpu || engine.gfx_version() >= GFX_VERSION_VEGA10
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn node(simd: u32, cores: u32) -> NodeInfo {
        NodeInfo {
            simd_count: simd,
            cpu_cores: cores,
            ..NodeInfo::default()
        }
    }

    #[test]
    fn dgpu_needs_a_compute_only_node() {
        assert!(!is_dgpu(&[node(0, 16), node(256, 4)]));
        assert!(is_dgpu(&[node(0, 16), node(256, 0)]));
    }

    #[test]
    fn svm_needed_from_vega10() {
        assert!(!is_svm_needed(false, EngineVersion::new(8, 0, 1)));
        assert!(is_svm_needed(false, EngineVersion::new(9, 0, 0)));
        assert!(is_svm_needed(true, EngineVersion::new(8, 0, 1)));
        assert_eq!(EngineVersion::new(9, 0, 10).gfx_version(), 90010);
    }

    #[test]
    fn override_parsing() {
        assert_eq!(
            EngineVersion::parse("10.3.0"),
            Some(EngineVersion::new(10, 3, 0))
        );
        assert_eq!(EngineVersion::parse("10.3"), None);
        assert_eq!(EngineVersion::parse("a.b.c"), None);
    }

    #[test]
    #[serial]
    fn per_node_override_wins() {
        // SAFETY: serialized with every other test touching the environment.
        unsafe {
            env::set_var("HSA_OVERRIDE_GFX_VERSION", "9.0.0");
            env::set_var("HSA_OVERRIDE_GFX_VERSION_3", "11.0.0");
        }
        let base = EngineVersion::new(8, 0, 3);
        let node3 = base.with_env_override(3);
        let node1 = base.with_env_override(1);
        unsafe {
            env::remove_var("HSA_OVERRIDE_GFX_VERSION");
            env::remove_var("HSA_OVERRIDE_GFX_VERSION_3");
        }

        assert_eq!(node3, EngineVersion::new(11, 0, 0));
        assert_eq!(node1, EngineVersion::new(9, 0, 0));
    }
}
