//! GPU device probing
//!
//! The orchestrator never touches CUDA itself; it only needs free-memory
//! headroom numbers. `DeviceProbe` is the seam: production uses the
//! `nvidia-smi` query interface, tests use fixed values. A probe failure is
//! reported as such and turned into `headroom_unknown` by the lease manager
//! unless the unprobed override is set.

use async_trait::async_trait;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe unavailable: {0}")]
    Unavailable(String),
    #[error("probe output malformed: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// Number of visible GPU devices.
    async fn device_count(&self) -> Result<u32, ProbeError>;
    /// Free memory on one device, in MB.
    async fn free_memory_mb(&self, gpu_index: u32) -> Result<u64, ProbeError>;
}

/// Probes devices by shelling out to `nvidia-smi`.
pub struct NvidiaSmiProbe;

impl NvidiaSmiProbe {
    async fn query_free(&self) -> Result<Vec<u64>, ProbeError> {
        let output = tokio::process::Command::new("nvidia-smi")
            .args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"])
            .output()
            .await
            .map_err(|err| ProbeError::Unavailable(err.to_string()))?;

        if !output.status.success() {
            return Err(ProbeError::Unavailable(format!(
                "nvidia-smi exited with {}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut free = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            free.push(
                line.parse::<u64>()
                    .map_err(|_| ProbeError::Malformed(format!("bad memory.free line `{line}`")))?,
            );
        }
        debug!(devices = free.len(), "probed GPU free memory");
        Ok(free)
    }
}

#[async_trait]
impl DeviceProbe for NvidiaSmiProbe {
    async fn device_count(&self) -> Result<u32, ProbeError> {
        Ok(self.query_free().await?.len() as u32)
    }

    async fn free_memory_mb(&self, gpu_index: u32) -> Result<u64, ProbeError> {
        let free = self.query_free().await?;
        free.get(gpu_index as usize).copied().ok_or_else(|| {
            ProbeError::Malformed(format!("gpu index {gpu_index} out of range"))
        })
    }
}

/// Fixed-value probe for tests and CPU-only environments.
pub struct FixedProbe {
    free_mb: Vec<u64>,
}

impl FixedProbe {
    pub fn new(free_mb: Vec<u64>) -> Self {
        Self { free_mb }
    }
}

#[async_trait]
impl DeviceProbe for FixedProbe {
    async fn device_count(&self) -> Result<u32, ProbeError> {
        Ok(self.free_mb.len() as u32)
    }

    async fn free_memory_mb(&self, gpu_index: u32) -> Result<u64, ProbeError> {
        self.free_mb
            .get(gpu_index as usize)
            .copied()
            .ok_or_else(|| ProbeError::Malformed(format!("gpu index {gpu_index} out of range")))
    }
}

/// A probe that always fails, for exercising the unknown-headroom path.
pub struct FailingProbe;

#[async_trait]
impl DeviceProbe for FailingProbe {
    async fn device_count(&self) -> Result<u32, ProbeError> {
        Err(ProbeError::Unavailable("NVML unavailable".into()))
    }

    async fn free_memory_mb(&self, _gpu_index: u32) -> Result<u64, ProbeError> {
        Err(ProbeError::Unavailable("NVML unavailable".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_probe() {
        let probe = FixedProbe::new(vec![22_000, 4_000]);
        assert_eq!(probe.device_count().await.unwrap(), 2);
        assert_eq!(probe.free_memory_mb(0).await.unwrap(), 22_000);
        assert!(probe.free_memory_mb(2).await.is_err());
    }
}
