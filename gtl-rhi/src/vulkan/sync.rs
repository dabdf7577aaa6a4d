//! Timeline semaphores and queue submission.

use ash::vk;

use super::{resolve, Context, SemaphoreRecord};
use crate::error::{fatal, recoverable, GpuError, GpuResult};
use crate::{CommandBuffer, Semaphore, SignalSemaphoreInfo, WaitSemaphoreInfo};

impl Context {
    pub fn create_semaphore(&mut self, initial_value: u64) -> GpuResult<Semaphore> {
        let mut type_create_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);

        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_create_info);

        let semaphore = match unsafe { self.device.device.create_semaphore(&create_info, None) } {
            Ok(semaphore) => semaphore,
            Err(err) => recoverable!(
                GpuError::CreationFailed("semaphore"),
                "failed to create semaphore: {err}"
            ),
        };

        let handle = self.semaphores.allocate();
        self.semaphores.insert(handle, SemaphoreRecord { semaphore });

        Ok(Semaphore(handle))
    }

    pub fn destroy_semaphore(&mut self, semaphore: Semaphore) {
        let Some(record) = self.semaphores.free(semaphore.0) else {
            fatal!("invalid handle!");
        };
        unsafe { self.device.device.destroy_semaphore(record.semaphore, None) };
    }

    /// Conjunctive wait on timeline values, up to `timeout_ns`. A timeout
    /// leaves device work running; callers re-wait or proceed at their own
    /// risk.
    pub fn wait_semaphores(
        &self,
        semaphore_infos: &[WaitSemaphoreInfo],
        timeout_ns: u64,
    ) -> GpuResult<()> {
        let semaphores: Vec<vk::Semaphore> = semaphore_infos
            .iter()
            .map(|info| resolve!(self, semaphores, info.semaphore).semaphore)
            .collect();
        let values: Vec<u64> = semaphore_infos.iter().map(|info| info.value).collect();

        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);

        match unsafe { self.device.timeline_semaphore.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout),
            Err(err) => recoverable!(
                GpuError::CreationFailed("semaphore wait"),
                "failed to wait for semaphores: {err}"
            ),
        }
    }

    /// Submits one command buffer with timeline wait/signal lists. All
    /// semaphore operations use the ALL_COMMANDS stage mask; ordering between
    /// command buffers is established exclusively through these values.
    pub fn submit_command_buffer(
        &mut self,
        command_buffer: CommandBuffer,
        signal_semaphore_infos: &[SignalSemaphoreInfo],
        wait_semaphore_infos: &[WaitSemaphoreInfo],
    ) {
        let command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;

        let signal_submit_infos: Vec<vk::SemaphoreSubmitInfo> = signal_semaphore_infos
            .iter()
            .map(|info| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(resolve!(self, semaphores, info.semaphore).semaphore)
                    .value(info.value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect();
        let wait_submit_infos: Vec<vk::SemaphoreSubmitInfo> = wait_semaphore_infos
            .iter()
            .map(|info| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(resolve!(self, semaphores, info.semaphore).semaphore)
                    .value(info.value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect();

        let command_buffer_submit_info =
            vk::CommandBufferSubmitInfo::default().command_buffer(command_buffer);

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_submit_infos)
            .command_buffer_infos(std::slice::from_ref(&command_buffer_submit_info))
            .signal_semaphore_infos(&signal_submit_infos);

        if let Err(err) = unsafe {
            self.device.synchronization2.queue_submit2(
                self.device.queue,
                &[submit_info],
                vk::Fence::null(),
            )
        } {
            fatal!("failed to submit command buffer: {err}");
        }
    }
}
