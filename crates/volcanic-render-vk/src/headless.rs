// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use std::time::Duration;

use crate::device::{probe_candidates, DeviceContext};
use crate::instance::{InstanceContext, ValidationMode};
use crate::select::{select_device, DeviceRequirements};
use crate::transfer::TransferEngine;

/// Instance, device and transfer engine without a surface. Used for offscreen
/// uploads and for exercising the upload path in tests.
pub struct HeadlessContext {
    transfer: TransferEngine,
    device: DeviceContext,
    instance: InstanceContext,
}

impl HeadlessContext {
    pub fn new(validation: ValidationMode) -> Result<Self> {
        let instance = InstanceContext::new(None, validation)?;
        let candidates = probe_candidates(&instance)?;
        let req = DeviceRequirements::headless();
        let selected = select_device(&candidates, &req)?;
        let device = DeviceContext::new(&instance, &selected, &req)?;
        let transfer = TransferEngine::new(&device, Duration::from_secs(10))?;
        Ok(Self {
            transfer,
            device,
            instance,
        })
    }

    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    pub fn transfer(&self) -> &TransferEngine {
        &self.transfer
    }

    pub fn validation_enabled(&self) -> bool {
        self.instance.validation_enabled()
    }
}
