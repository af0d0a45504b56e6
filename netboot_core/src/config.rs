use clap::Parser;
use std::path::PathBuf;

use crate::error::{HandoffError, HandoffResult};

/// Largest command line the zero page can point at that we still accept.
const CMDLINE_MAX: usize = 4095;

#[derive(Parser, Debug, Clone)]
#[command(name = "netboot-handoff")]
#[command(version = "0.3.0")]
#[command(about = "Rehearse the Evo T30 Linux handoff against a simulated board", long_about = None)]
pub struct HandoffConfig {
    /// Path to kernel image (bzImage)
    #[arg(short, long, default_value = "bzImage")]
    pub kernel: PathBuf,

    /// Path to initial ramdisk (optional)
    #[arg(short, long)]
    pub initrd: Option<PathBuf>,

    /// Kernel command line
    #[arg(long, default_value = "auto")]
    pub cmdline: String,

    /// RAM size in KiB (the Evo T30 exposes 29.5 MiB)
    #[arg(short, long, default_value = "30208")]
    pub memory_kib: u32,

    /// Raw e820 table (20-byte records) to use instead of the built-in map
    #[arg(long)]
    pub e820: Option<PathBuf>,

    /// Dump registers, CPUID and descriptor tables before the handoff
    #[arg(short, long)]
    pub debug: bool,

    /// Increase verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl HandoffConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> HandoffResult<()> {
        // Whole pages only
        if self.memory_kib % 4 != 0 {
            return Err(HandoffError::InvalidConfiguration(format!(
                "Memory size must be a multiple of 4 KiB. Got: {} KiB",
                self.memory_kib
            )));
        }

        // The payload sits at 16.5 MiB on the real machine
        if self.memory_kib < 24 * 1024 {
            return Err(HandoffError::InvalidConfiguration(format!(
                "Memory size too small. Minimum: 24 MiB, Got: {} KiB",
                self.memory_kib
            )));
        }

        if self.memory_kib > 1024 * 1024 {
            return Err(HandoffError::InvalidConfiguration(format!(
                "Memory size too large. Maximum: 1 GiB, Got: {} KiB",
                self.memory_kib
            )));
        }

        if self.cmdline.len() > CMDLINE_MAX || self.cmdline.contains('\0') {
            return Err(HandoffError::InvalidConfiguration(format!(
                "Command line must be at most {} bytes without NUL characters",
                CMDLINE_MAX
            )));
        }

        if !self.kernel.exists() {
            return Err(HandoffError::InvalidConfiguration(format!(
                "Kernel image not found: {}",
                self.kernel.display()
            )));
        }

        for path in [&self.initrd, &self.e820].into_iter().flatten() {
            if !path.exists() {
                return Err(HandoffError::InvalidConfiguration(format!(
                    "File not found: {}",
                    path.display()
                )));
            }
        }

        Ok(())
    }

    /// Get tracing log level based on verbosity
    pub fn log_level(&self) -> &str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    /// Get memory size in bytes
    pub fn memory_bytes(&self) -> u32 {
        self.memory_kib * 1024
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            kernel: PathBuf::from("bzImage"),
            initrd: None,
            cmdline: String::from("auto"),
            memory_kib: 30208,
            e820: None,
            debug: false,
            verbose: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        let config = HandoffConfig::parse_from([
            "netboot-handoff",
            "--kernel",
            "/tmp/vmlinuz",
            "--cmdline",
            "console=ttyS0",
            "-m",
            "65536",
            "-vv",
            "--debug",
        ]);
        assert_eq!(config.kernel, PathBuf::from("/tmp/vmlinuz"));
        assert_eq!(config.cmdline, "console=ttyS0");
        assert_eq!(config.memory_bytes(), 64 * 1024 * 1024);
        assert_eq!(config.log_level(), "debug");
        assert!(config.debug);
        assert!(config.initrd.is_none());
    }

    #[test]
    fn test_defaults_match_evo_t30() {
        let config = HandoffConfig::parse_from(["netboot-handoff"]);
        assert_eq!(config.memory_bytes(), 0x01D8_0000);
        assert_eq!(config.cmdline, "auto");
        assert_eq!(config.log_level(), "warn");
        assert_eq!(HandoffConfig::default().memory_kib, config.memory_kib);
    }

    #[test]
    fn test_validate_memory() {
        let exe = std::env::current_exe().unwrap();
        let mut config = HandoffConfig { kernel: exe, ..HandoffConfig::default() };
        assert!(config.validate().is_ok());

        config.memory_kib = 30210;
        assert!(config.validate().is_err());
        config.memory_kib = 16 * 1024;
        assert!(config.validate().is_err());
        config.memory_kib = 2 * 1024 * 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_files() {
        let mut config = HandoffConfig {
            kernel: PathBuf::from("/nonexistent/bzImage"),
            ..HandoffConfig::default()
        };
        assert!(matches!(config.validate(), Err(HandoffError::InvalidConfiguration(_))));

        config.kernel = std::env::current_exe().unwrap();
        config.initrd = Some(PathBuf::from("/nonexistent/initrd"));
        assert!(config.validate().is_err());

        config.initrd = None;
        config.cmdline = String::from("root=/dev/ram0\0");
        assert!(config.validate().is_err());
    }
}
