/// Workgroup size for generated kernels. Overridable via `TENSORLOOM_WG`.
pub const WORKGROUP_SIZE: u32 = 256;

/// Inputs with at most this many elements that live on the CPU are passed
/// to kernels as inlined uniform arrays instead of storage buffers.
pub const DEFAULT_UNIFORM_THRESHOLD: usize = 4;

/// Soft GPU byte budget used by the pager when paging is enabled.
pub const DEFAULT_PAGING_BUDGET_BYTES: usize = 256 * 1024 * 1024;

/// Physical storage dimensions above this fold into a squarish footprint.
pub const DEFAULT_MAX_STORAGE_DIM: usize = 16_384;

/// Runtime feature flags and tuning knobs for a backend instance. Values
/// come from `Default` / `from_env`; the backend never consults process
/// globals after construction.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub workgroup_size: u32,
    pub uniform_threshold: usize,
    pub paging_enabled: bool,
    pub paging_budget_bytes: usize,
    /// Leave packed outputs packed instead of eagerly unpacking them.
    pub lazy_unpack: bool,
    pub max_storage_dim: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            workgroup_size: WORKGROUP_SIZE,
            uniform_threshold: DEFAULT_UNIFORM_THRESHOLD,
            paging_enabled: false,
            paging_budget_bytes: DEFAULT_PAGING_BUDGET_BYTES,
            lazy_unpack: false,
            max_storage_dim: DEFAULT_MAX_STORAGE_DIM,
        }
    }
}

impl BackendConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(wg) = env_parse::<u32>("TENSORLOOM_WG") {
            if wg > 0 {
                cfg.workgroup_size = wg;
            }
        }
        if let Some(threshold) = env_parse::<usize>("TENSORLOOM_UNIFORM_THRESHOLD") {
            cfg.uniform_threshold = threshold;
        }
        if let Some(flag) = env_parse::<u8>("TENSORLOOM_PAGING") {
            cfg.paging_enabled = flag != 0;
        }
        if let Some(budget) = env_parse::<usize>("TENSORLOOM_PAGING_BUDGET_BYTES") {
            cfg.paging_budget_bytes = budget;
        }
        if let Some(flag) = env_parse::<u8>("TENSORLOOM_LAZY_UNPACK") {
            cfg.lazy_unpack = flag != 0;
        }
        if let Some(dim) = env_parse::<usize>("TENSORLOOM_MAX_STORAGE_DIM") {
            if dim > 0 {
                cfg.max_storage_dim = dim;
            }
        }
        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = BackendConfig::default();
        assert_eq!(cfg.workgroup_size, WORKGROUP_SIZE);
        assert_eq!(cfg.uniform_threshold, 4);
        assert!(!cfg.paging_enabled);
        assert!(!cfg.lazy_unpack);
    }
}
