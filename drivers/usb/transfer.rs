//! One-shot control transfers on the EHCI async schedule
//!
//! Every transfer gets its own queue head and SETUP / DATA / STATUS
//! descriptors from the DMA allocator. The bump allocator never reclaims
//! them, so each transfer permanently consumes DMA memory.

use log::debug;

use super::ehci::{EhciController, RegisterWindow};
use super::queue::{endpoint_characteristics, Pid, QueueHead, TransferDescriptor, LINK_TERMINATE};
use super::request::SetupPacket;
use super::{Direction, UsbError};
use crate::memory::{DmaAllocator, DmaBox, DmaBuffer, PAGE_SIZE};

/// Longest data stage accepted, whatever the buffer's offset in its page.
pub const MAX_DATA_STAGE: usize = 4 * PAGE_SIZE;

/// Alignment of data stage bounce buffers.
const DATA_BUFFER_ALIGN: usize = 4;

/// Device endpoint a control transfer is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTarget {
    pub address: u8,
    pub endpoint: u8,
    pub max_packet: u16,
}

impl ControlTarget {
    /// Endpoint zero of the device at `address`.
    pub const fn default_pipe(address: u8, max_packet: u16) -> Self {
        Self {
            address,
            endpoint: 0,
            max_packet,
        }
    }
}

/// How the wait on the STATUS stage ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Retired,
    /// An earlier stage halted, so the STATUS stage will never run.
    Halted,
    Pending,
}

/// Descriptor chain for a single control transfer
pub struct ControlChain {
    queue_head: DmaBox<QueueHead>,
    setup: DmaBox<TransferDescriptor>,
    data: Option<DmaBox<TransferDescriptor>>,
    status: DmaBox<TransferDescriptor>,
    setup_packet: DmaBox<[u8; 8]>,
    data_buffer: Option<DmaBuffer>,
}

impl ControlChain {
    /// Allocate and link the queue head and stage descriptors.
    ///
    /// `data` supplies the length of the data stage and, for OUT transfers,
    /// its contents. An empty `data` builds a SETUP + STATUS chain.
    pub fn build<A: DmaAllocator + ?Sized>(
        dma: &mut A,
        target: ControlTarget,
        setup: &SetupPacket,
        data: &[u8],
        direction: Direction,
    ) -> Result<Self, UsbError> {
        let length = data.len();
        if length > MAX_DATA_STAGE {
            return Err(UsbError::BufferTooLarge(length));
        }

        let mut queue_head = alloc(QueueHead::new(), dma)?;
        let mut setup_td = alloc(TransferDescriptor::new(), dma)?;
        let mut data_td = if length > 0 {
            Some(alloc(TransferDescriptor::new(), dma)?)
        } else {
            None
        };
        let mut status_td = alloc(TransferDescriptor::new(), dma)?;

        let setup_packet = alloc(setup.to_bytes(), dma)?;
        let data_buffer = if length > 0 {
            let mut buffer = dma
                .allocate(length, DATA_BUFFER_ALIGN)
                .ok_or(UsbError::AllocationFailed)?;
            match direction {
                Direction::Out => buffer.as_mut_slice().copy_from_slice(data),
                Direction::In => buffer.as_mut_slice().fill(0),
            }
            Some(buffer)
        } else {
            None
        };

        status_td.link_to(LINK_TERMINATE);
        status_td.prepare(direction.opposite().into(), 0, true, None);

        match (data_td.as_mut(), data_buffer.as_ref()) {
            (Some(td), Some(buffer)) => {
                td.link_to(status_td.phys());
                td.prepare(direction.into(), length as u16, true, Some(buffer.phys()));
                setup_td.link_to(td.phys());
            }
            _ => setup_td.link_to(status_td.phys()),
        }
        setup_td.prepare(Pid::Setup, 8, false, Some(setup_packet.phys()));

        let queue_head_address = queue_head.phys();
        queue_head.configure(
            queue_head_address,
            endpoint_characteristics(target.address, target.endpoint, target.max_packet),
        );
        queue_head.set_first_qtd(setup_td.phys());

        Ok(Self {
            queue_head,
            setup: setup_td,
            data: data_td,
            status: status_td,
            setup_packet,
            data_buffer,
        })
    }

    /// Hand the chain to the controller and spin until the STATUS stage
    /// retires, an earlier stage halts or `spins` polls have passed. The
    /// async schedule is switched off again on every outcome.
    pub fn submit<W: RegisterWindow>(
        &self,
        controller: &mut EhciController<W>,
        spins: u32,
    ) -> Result<(), UsbError> {
        controller.start_async(self.queue_head.phys());
        let completion = self.wait_for_status(spins);
        controller.stop_async();

        let address = self.queue_head.endpoint_characteristics() & 0x7F;
        match completion {
            Completion::Retired => Ok(()),
            Completion::Halted => {
                debug!("EHCI transfer to addr {} halted before the status stage", address);
                Err(UsbError::Timeout)
            }
            Completion::Pending => {
                debug!(
                    "EHCI transfer to addr {} timed out, status token {:#010x}",
                    address,
                    self.status.token()
                );
                Err(UsbError::Timeout)
            }
        }
    }

    /// Spin on the STATUS stage for at most `spins` polls.
    pub fn wait_for_status(&self, spins: u32) -> Completion {
        for _ in 0..spins {
            if !self.status.is_active() {
                return Completion::Retired;
            }
            if self.setup.is_halted() || self.data.as_ref().is_some_and(|td| td.is_halted()) {
                return Completion::Halted;
            }
            core::hint::spin_loop();
        }
        Completion::Pending
    }

    /// Copy the data stage back out of DMA memory.
    pub fn read_data(&self, out: &mut [u8]) {
        if let Some(buffer) = &self.data_buffer {
            let len = out.len().min(buffer.len());
            out[..len].copy_from_slice(&buffer.as_slice()[..len]);
        }
    }

    /// Number of transfer descriptors in the chain.
    pub fn stage_count(&self) -> usize {
        2 + self.data.is_some() as usize
    }

    pub fn queue_head(&self) -> &QueueHead {
        &self.queue_head
    }

    pub fn queue_head_address(&self) -> u32 {
        self.queue_head.phys()
    }

    pub fn setup_stage(&self) -> &TransferDescriptor {
        &self.setup
    }

    pub fn data_stage(&self) -> Option<&TransferDescriptor> {
        self.data.as_deref()
    }

    pub fn status_stage(&self) -> &TransferDescriptor {
        &self.status
    }

    pub fn setup_packet(&self) -> &[u8; 8] {
        &self.setup_packet
    }
}

fn alloc<T, A: DmaAllocator + ?Sized>(value: T, dma: &mut A) -> Result<DmaBox<T>, UsbError> {
    DmaBox::new_in(value, dma).ok_or(UsbError::AllocationFailed)
}

/// Run one control transfer to completion.
///
/// For IN transfers `data` receives the data stage on success. A transfer is
/// all or nothing: no partial byte count is reported.
pub fn control_transfer<W: RegisterWindow, A: DmaAllocator + ?Sized>(
    controller: &mut EhciController<W>,
    dma: &mut A,
    target: ControlTarget,
    setup: &SetupPacket,
    data: &mut [u8],
    direction: Direction,
    spins: u32,
) -> Result<(), UsbError> {
    let chain = ControlChain::build(dma, target, setup, data, direction).map_err(|err| {
        debug!("EHCI transfer setup failed: {}", err);
        err
    })?;
    chain.submit(controller, spins)?;
    if direction == Direction::In {
        chain.read_data(data);
    }
    Ok(())
}
