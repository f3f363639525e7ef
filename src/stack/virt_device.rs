//! Virtual smoltcp device fed with frames injected from the TUN read loop.
//! Frames the interface transmits are queued on a channel and written back
//! to the TUN device by the stack loop.

use std::collections::VecDeque;

use smoltcp::{
    phy::{self, Device, DeviceCapabilities, Medium},
    time::Instant,
};
use tokio::sync::mpsc;

pub struct VirtDevice {
    capabilities: DeviceCapabilities,
    in_queue: VecDeque<Vec<u8>>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl VirtDevice {
    pub fn new(mtu: usize) -> (VirtDevice, mpsc::UnboundedReceiver<Vec<u8>>) {
        let mut capabilities = DeviceCapabilities::default();
        capabilities.medium = Medium::Ip;
        capabilities.max_transmission_unit = mtu;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            VirtDevice {
                capabilities,
                in_queue: VecDeque::new(),
                out_tx,
            },
            out_rx,
        )
    }

    pub fn inject_packet(&mut self, frame: Vec<u8>) {
        self.in_queue.push_back(frame);
    }
}

impl<'d> Device<'d> for VirtDevice {
    type RxToken = VirtRxToken;
    type TxToken = VirtTxToken<'d>;

    fn receive(&'d mut self) -> Option<(Self::RxToken, Self::TxToken)> {
        let buffer = self.in_queue.pop_front()?;
        Some((VirtRxToken { buffer }, VirtTxToken(&self.out_tx)))
    }

    fn transmit(&'d mut self) -> Option<Self::TxToken> {
        Some(VirtTxToken(&self.out_tx))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities.clone()
    }
}

pub struct VirtRxToken {
    buffer: Vec<u8>,
}

impl phy::RxToken for VirtRxToken {
    fn consume<R, F>(mut self, _timestamp: Instant, f: F) -> smoltcp::Result<R>
    where
        F: FnOnce(&mut [u8]) -> smoltcp::Result<R>,
    {
        f(&mut self.buffer)
    }
}

pub struct VirtTxToken<'a>(&'a mpsc::UnboundedSender<Vec<u8>>);

impl phy::TxToken for VirtTxToken<'_> {
    fn consume<R, F>(self, _timestamp: Instant, len: usize, f: F) -> smoltcp::Result<R>
    where
        F: FnOnce(&mut [u8]) -> smoltcp::Result<R>,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer)?;
        // receiver lives as long as the stack loop
        let _ = self.0.send(buffer);
        Ok(result)
    }
}
