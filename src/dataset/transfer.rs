//! Typed device transfer
//!
//! Batches only ever move as a single tensor or as an (images, targets)
//! pair, so transfer is defined for exactly those two shapes.
//! Transfers issued from one thread are applied in order, and reading a
//! tensor's data waits for its transfer to finish.

use burn::tensor::{backend::Backend, BasicOps, Tensor};

/// Move a batch element (or pair of elements) onto a device
pub trait DeviceTransfer<B: Backend>: Sized {
    fn transfer(self, device: &B::Device) -> Self;
}

impl<B, const D: usize, K> DeviceTransfer<B> for Tensor<B, D, K>
where
    B: Backend,
    K: BasicOps<B>,
{
    fn transfer(self, device: &B::Device) -> Self {
        self.to_device(device)
    }
}

impl<B, const D1: usize, const D2: usize, K1, K2> DeviceTransfer<B>
    for (Tensor<B, D1, K1>, Tensor<B, D2, K2>)
where
    B: Backend,
    K1: BasicOps<B>,
    K2: BasicOps<B>,
{
    fn transfer(self, device: &B::Device) -> Self {
        let (first, second) = self;
        (first.to_device(device), second.to_device(device))
    }
}
