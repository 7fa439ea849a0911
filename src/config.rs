use anyhow::{bail, Context};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

use crate::scoring::MEDIUM_FLOOR;

/// Execution target for the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu,
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" | "cuda" => Ok(Device::Gpu),
            other => bail!("unknown device '{}', expected cpu or gpu", other),
        }
    }
}

/// Where localization artifacts are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSpec {
    /// Plain files under a root directory.
    Directory(PathBuf),
    /// A sled database.
    Sled(PathBuf),
}

impl FromStr for StoreSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.split_once(':') {
            Some(("dir", path)) if !path.is_empty() => Ok(StoreSpec::Directory(path.into())),
            Some(("sled", path)) if !path.is_empty() => Ok(StoreSpec::Sled(path.into())),
            _ => bail!("store must be 'dir:<path>' or 'sled:<path>', got '{}'", s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// JPEG quality of the single ELA recompression pass.
    pub quality: u8,
    /// Rasterization resolution for PDF pages.
    pub dpi: u32,
    pub tamper_threshold: f64,
    pub device: Device,
    /// Loan / customer id used to build artifact keys.
    pub document_id: Option<String>,
    pub artifact_store: Option<StoreSpec>,
    /// Local ResNet-50 safetensors checkpoint; the hub copy is used when unset.
    pub model_weights: Option<PathBuf>,
    /// Documents analyzed concurrently in a batch.
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            quality: 90,
            dpi: 200,
            tamper_threshold: 0.5,
            device: Device::Cpu,
            document_id: None,
            artifact_store: None,
            model_weights: None,
            workers: 2,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            quality: parse_var("FORENSICS_QUALITY")?.unwrap_or(defaults.quality),
            dpi: parse_var("FORENSICS_DPI")?.unwrap_or(defaults.dpi),
            tamper_threshold: parse_var("FORENSICS_TAMPER_THRESHOLD")?
                .unwrap_or(defaults.tamper_threshold),
            device: parse_var("FORENSICS_DEVICE")?.unwrap_or(defaults.device),
            document_id: env::var("FORENSICS_DOCUMENT_ID").ok().filter(|s| !s.is_empty()),
            artifact_store: parse_var("FORENSICS_STORE")?,
            model_weights: env::var("FORENSICS_MODEL_WEIGHTS").ok().map(PathBuf::from),
            workers: parse_var("FORENSICS_WORKERS")?.unwrap_or(defaults.workers),
        };
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=100).contains(&self.quality) {
            bail!("quality must be within 1..=100, got {}", self.quality);
        }
        if self.dpi == 0 {
            bail!("dpi must be positive");
        }
        if !(0.0..=1.0).contains(&self.tamper_threshold) {
            bail!(
                "tamper threshold must be within [0, 1], got {}",
                self.tamper_threshold
            );
        }
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.tamper_threshold > MEDIUM_FLOOR {
            // The Medium-tier floor still triggers localization, so a higher threshold has no effect.
            warn!(
                threshold = self.tamper_threshold,
                floor = MEDIUM_FLOOR,
                "tamper threshold above the Medium floor is inert for localization"
            );
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("{} has an invalid value '{}'", name, raw)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.quality, 90);
        assert_eq!(c.dpi, 200);
        assert_eq!(c.tamper_threshold, 0.5);
        assert_eq!(c.device, Device::Cpu);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut c = Config::default();
        c.quality = 0;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.tamper_threshold = 1.5;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.dpi = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn high_threshold_is_accepted() {
        let mut c = Config::default();
        c.tamper_threshold = 0.8;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn store_spec_parsing() {
        assert_eq!(
            "dir:/tmp/out".parse::<StoreSpec>().unwrap(),
            StoreSpec::Directory("/tmp/out".into())
        );
        assert_eq!(
            "sled:data/db/artifacts".parse::<StoreSpec>().unwrap(),
            StoreSpec::Sled("data/db/artifacts".into())
        );
        assert!("s3:bucket".parse::<StoreSpec>().is_err());
        assert!("dir:".parse::<StoreSpec>().is_err());
    }

    #[test]
    fn device_parsing() {
        assert_eq!("GPU".parse::<Device>().unwrap(), Device::Gpu);
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Gpu);
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert!("tpu".parse::<Device>().is_err());
    }
}
