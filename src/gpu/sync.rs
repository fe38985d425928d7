//! Fences and readback.
//!
//! Waiting never blocks inside an async runtime: the device is polled
//! without blocking and the task sleeps between polls, backing off from
//! 1 ms to 32 ms. Both the fence and buffer mapping are retried once before
//! the failure is reported.

use std::time::Duration;

use tokio::sync::oneshot;

use super::Gpu;
use crate::error::{Error, Result};

const MIN_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(32);

impl Gpu {
    /// Resolve once all submitted work has completed.
    pub async fn wait_for_idle(&self) -> Result<()> {
        match self.fence().await {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(error = %first, "device sync failed, retrying");
                self.fence().await.map_err(Error::SyncFailed)
            }
        }
    }

    async fn fence(&self) -> std::result::Result<(), String> {
        let (tx, mut rx) = oneshot::channel();
        self.queue().on_submitted_work_done(move || {
            let _ = tx.send(());
        });
        let mut delay = MIN_BACKOFF;
        loop {
            let _ = self.device().poll(wgpu::Maintain::Poll);
            match rx.try_recv() {
                Ok(()) => return Ok(()),
                Err(oneshot::error::TryRecvError::Closed) => {
                    return Err("fence was dropped without signalling".to_string())
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
            sleep(delay).await;
            delay = (delay * 2).min(MAX_BACKOFF);
        }
    }

    /// Copy the first `size` bytes of `source` to the host.
    pub(crate) async fn read_words(&self, source: &wgpu::Buffer, size: u64) -> Result<Vec<u32>> {
        let staging = self.staging_buffer(size.next_power_of_two())?;
        let mut encoder = self
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("glc readback"),
            });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        self.queue().submit(Some(encoder.finish()));

        let mut last = String::new();
        for attempt in 0..2 {
            let (tx, rx) = oneshot::channel();
            let slice = staging.slice(..size);
            slice.map_async(wgpu::MapMode::Read, move |r| {
                let _ = tx.send(r);
            });
            let _ = self.device().poll(wgpu::Maintain::Wait);
            match rx.await {
                Ok(Ok(())) => {
                    let words = {
                        let mapped = slice.get_mapped_range();
                        bytemuck::cast_slice::<u8, u32>(&mapped).to_vec()
                    };
                    staging.unmap();
                    return Ok(words);
                }
                Ok(Err(e)) => last = e.to_string(),
                Err(_) => last = "mapping callback was dropped".to_string(),
            }
            if attempt == 0 {
                tracing::warn!(error = %last, "buffer mapping failed, retrying");
            }
        }
        Err(Error::BufferMapping(last))
    }
}

/// Sleep on the tokio timer when inside a runtime, otherwise block the
/// thread (e.g. under `pollster`).
pub(crate) async fn sleep(duration: Duration) {
    if tokio::runtime::Handle::try_current().is_ok() {
        tokio::time::sleep(duration).await;
    } else {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_bounds() {
        let mut delay = MIN_BACKOFF;
        let mut steps = Vec::new();
        for _ in 0..8 {
            steps.push(delay.as_millis());
            delay = (delay * 2).min(MAX_BACKOFF);
        }
        assert_eq!(steps, vec![1, 2, 4, 8, 16, 32, 32, 32]);
    }

    #[test]
    fn test_sleep_outside_runtime() {
        pollster::block_on(sleep(Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn test_sleep_inside_runtime() {
        sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test]
    #[ignore = "requires GPU"]
    async fn test_wait_for_idle() {
        let gpu = Gpu::new().unwrap();
        gpu.queue().submit(None);
        gpu.wait_for_idle().await.unwrap();
    }
}
