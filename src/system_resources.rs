use sysinfo::{System, SystemExt};

// sysinfo reports memory in bytes
const BYTES_PER_GB: f32 = 1024.0 * 1024.0 * 1024.0;

/// Memory and CPU snapshot taken before the model is loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemResources {
    pub cpu_core_count: usize,
    pub ram_total_bytes: u64,
    pub ram_available_bytes: u64,
}

impl SystemResources {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        Self {
            cpu_core_count: sys.cpus().len(),
            ram_total_bytes: sys.total_memory(),
            ram_available_bytes: sys.available_memory(),
        }
    }

    pub fn ram_total_gb(&self) -> f32 {
        self.ram_total_bytes as f32 / BYTES_PER_GB
    }

    pub fn ram_available_gb(&self) -> f32 {
        self.ram_available_bytes as f32 / BYTES_PER_GB
    }

    /// Whether `bytes` fit in currently available RAM. An unknown (zero)
    /// reading is treated as fitting so the caller only warns on real data.
    pub fn fits_in_ram(&self, bytes: u64) -> bool {
        self.ram_available_bytes == 0 || bytes <= self.ram_available_bytes
    }
}

impl Default for SystemResources {
    fn default() -> Self {
        Self::new()
    }
}

pub fn bytes_to_gb(bytes: u64) -> f32 {
    bytes as f32 / BYTES_PER_GB
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_snapshot_is_consistent() {
        let resources = SystemResources::new();
        assert!(resources.ram_available_bytes <= resources.ram_total_bytes || resources.ram_total_bytes == 0);
    }

    #[test]
    fn test_fits_in_ram() {
        let resources = SystemResources {
            cpu_core_count: 4,
            ram_total_bytes: 16 << 30,
            ram_available_bytes: 8 << 30,
        };
        assert!(resources.fits_in_ram(4 << 30));
        assert!(!resources.fits_in_ram(9 << 30));
        assert_abs_diff_eq!(resources.ram_available_gb(), 8.0, epsilon = 1e-4);
        assert_abs_diff_eq!(resources.ram_total_gb(), 16.0, epsilon = 1e-4);
    }

    #[test]
    fn test_unknown_memory_fits() {
        let resources = SystemResources { cpu_core_count: 1, ram_total_bytes: 0, ram_available_bytes: 0 };
        assert!(resources.fits_in_ram(u64::MAX));
    }
}
