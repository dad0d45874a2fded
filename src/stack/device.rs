// 虚拟网络设备：smoltcp 与 TUN 之间的包队列
//
// 从 TUN 读到的 IP 包放入 rx 队列供协议栈处理，
// 协议栈（以及手工构造的 UDP/ICMP 包）产生的 IP 包进入 tx 队列，
// 由事件循环写回 TUN。

use std::collections::VecDeque;

use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant as SmolInstant;

pub(crate) struct VirtualDevice {
    rx_queue: VecDeque<Vec<u8>>,
    tx_queue: VecDeque<Vec<u8>>,
    mtu: usize,
}

impl VirtualDevice {
    pub(crate) fn new(mtu: usize) -> Self {
        VirtualDevice {
            rx_queue: VecDeque::new(),
            tx_queue: VecDeque::new(),
            mtu,
        }
    }

    pub(crate) fn mtu(&self) -> usize {
        self.mtu
    }

    /// 注入来自 TUN 的 IP 包
    pub(crate) fn inject_packet(&mut self, packet: Vec<u8>) {
        self.rx_queue.push_back(packet);
    }

    /// 绕过协议栈直接发出的包（UDP 回包、ICMP 不可达）
    pub(crate) fn push_tx(&mut self, packet: Vec<u8>) {
        self.tx_queue.push_back(packet);
    }

    /// 取出待写回 TUN 的 IP 包
    pub(crate) fn take_packet(&mut self) -> Option<Vec<u8>> {
        self.tx_queue.pop_front()
    }

    pub(crate) fn has_pending_rx(&self) -> bool {
        !self.rx_queue.is_empty()
    }
}

pub(crate) struct VirtualRxToken {
    data: Vec<u8>,
}

impl RxToken for VirtualRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.data)
    }
}

pub(crate) struct VirtualTxToken<'a> {
    tx_queue: &'a mut VecDeque<Vec<u8>>,
}

impl<'a> TxToken for VirtualTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        self.tx_queue.push_back(buf);
        result
    }
}

impl Device for VirtualDevice {
    type RxToken<'a> = VirtualRxToken;
    type TxToken<'a> = VirtualTxToken<'a>;

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let data = self.rx_queue.pop_front()?;
        Some((
            VirtualRxToken { data },
            VirtualTxToken { tx_queue: &mut self.tx_queue },
        ))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(VirtualTxToken { tx_queue: &mut self.tx_queue })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}
