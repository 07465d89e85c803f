//! Target description handed to the code generator.
//!
//! The JIT always targets the host process, so the descriptor is detected
//! from the compile-time configuration rather than from a triple string.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    Aarch64,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingSystem {
    Linux,
    MacOs,
    Windows,
    OtherUnix,
    Other,
}

/// Architecture, OS and symbol conventions of the executing process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub arch: Architecture,
    pub os: OperatingSystem,
    pub pointer_width: u8,
    /// Prefix the platform linker puts in front of C-level names.
    pub global_prefix: Option<char>,
}

impl TargetDescriptor {
    pub fn host() -> Self {
        let arch = if cfg!(target_arch = "x86_64") {
            Architecture::X86_64
        } else if cfg!(target_arch = "aarch64") {
            Architecture::Aarch64
        } else {
            Architecture::Other
        };

        let os = if cfg!(target_os = "linux") {
            OperatingSystem::Linux
        } else if cfg!(target_os = "macos") {
            OperatingSystem::MacOs
        } else if cfg!(target_os = "windows") {
            OperatingSystem::Windows
        } else if cfg!(unix) {
            OperatingSystem::OtherUnix
        } else {
            OperatingSystem::Other
        };

        let global_prefix = if os == OperatingSystem::MacOs {
            Some('_')
        } else {
            None
        };

        Self {
            arch,
            os,
            pointer_width: (std::mem::size_of::<usize>() * 8) as u8,
            global_prefix,
        }
    }

    /// Whether generated code can use the System V AMD64 calling convention.
    pub fn is_sysv_x86_64(&self) -> bool {
        self.arch == Architecture::X86_64
            && matches!(
                self.os,
                OperatingSystem::Linux | OperatingSystem::MacOs | OperatingSystem::OtherUnix
            )
    }
}

impl Default for TargetDescriptor {
    fn default() -> Self {
        Self::host()
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}-{:?} ({}-bit)", self.arch, self.os, self.pointer_width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_detection() {
        let target = TargetDescriptor::host();
        assert_eq!(target.pointer_width as usize, std::mem::size_of::<usize>() * 8);

        #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
        {
            assert!(target.is_sysv_x86_64());
            assert_eq!(target.global_prefix, None);
        }
    }
}
