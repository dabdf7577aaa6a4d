//! Shared events as timeline semaphores, and queue submission.

use objc2_metal as mtl;
use objc2_metal::{MTL4CommandQueue, MTLDevice, MTLSharedEvent};

use super::{resolve, Context, SemaphoreRecord};
use crate::error::{fatal, recoverable, GpuError, GpuResult};
use crate::{CommandBuffer, Semaphore, SignalSemaphoreInfo, WaitSemaphoreInfo};

impl Context {
    pub fn create_semaphore(&mut self, initial_value: u64) -> GpuResult<Semaphore> {
        let Some(event) = (unsafe { self.device.device.newSharedEvent() }) else {
            recoverable!(
                GpuError::CreationFailed("semaphore"),
                "failed to create shared event"
            );
        };
        unsafe { event.setSignaledValue(initial_value) };

        let handle = self.semaphores.allocate();
        self.semaphores.insert(handle, SemaphoreRecord { event });

        Ok(Semaphore(handle))
    }

    pub fn destroy_semaphore(&mut self, semaphore: Semaphore) {
        if self.semaphores.free(semaphore.0).is_none() {
            fatal!("invalid handle!");
        }
    }

    /// Conjunctive wait; a timeout leaves device work running.
    pub fn wait_semaphores(
        &self,
        semaphore_infos: &[WaitSemaphoreInfo],
        timeout_ns: u64,
    ) -> GpuResult<()> {
        let timeout_ms = timeout_ns / 1_000_000;

        for info in semaphore_infos {
            let record = resolve!(self, semaphores, info.semaphore);
            let signaled = unsafe {
                record.event.waitUntilSignaledValue_timeoutMS(info.value, timeout_ms)
            };
            if !signaled {
                return Err(GpuError::Timeout);
            }
        }

        Ok(())
    }

    /// Queue-level waits, one commit, then queue-level signals.
    pub fn submit_command_buffer(
        &mut self,
        command_buffer: CommandBuffer,
        signal_semaphore_infos: &[SignalSemaphoreInfo],
        wait_semaphore_infos: &[WaitSemaphoreInfo],
    ) {
        let queue = self.device.command_queue.clone();

        for info in wait_semaphore_infos {
            let record = resolve!(self, semaphores, info.semaphore);
            unsafe { queue.waitForEvent_value(&record.event, info.value) };
        }

        {
            let record = resolve!(self, command_buffers, command_buffer);
            let mut buffers = [core::ptr::NonNull::from(&*record.command_buffer)];
            let ptr = unsafe { core::ptr::NonNull::new_unchecked(buffers.as_mut_ptr()) };
            unsafe { queue.commit_count(ptr, 1) };
        }

        for info in signal_semaphore_infos {
            let record = resolve!(self, semaphores, info.semaphore);
            unsafe { queue.signalEvent_value(&record.event, info.value) };
        }
    }
}
