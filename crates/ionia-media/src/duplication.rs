// crates/ionia-media/src/duplication.rs
//
// DXGI desktop duplication adapter. Delivers tightly packed RGBA frames
// (swapped from the duplication API's BGRA, row pitch stripped) into the
// caller's buffer.
//
// Access loss (mode switch, secure desktop, another duplication client)
// is an expected runtime condition: the duplication interface is torn
// down and recreated in place, and the current acquire reports "no frame"
// rather than an error.

use std::time::Duration;

use anyhow::{anyhow, Result};
use windows::core::Interface;
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_HARDWARE;
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D,
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_FLAG, D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_READ,
    D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::{
    IDXGIDevice, IDXGIOutput1, IDXGIOutputDuplication, IDXGIResource,
    DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_WAIT_TIMEOUT, DXGI_OUTDUPL_FRAME_INFO,
};

use crate::capture::{bgra_to_rgba_packed, DesktopSource};

pub struct DxgiDuplication {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    duplication: Option<IDXGIOutputDuplication>,
    staging: Option<ID3D11Texture2D>,
    width: u32,
    height: u32,
}

// Driven exclusively from the video-capture worker.
unsafe impl Send for DxgiDuplication {}

impl DxgiDuplication {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let mut device: Option<ID3D11Device> = None;
        let mut context: Option<ID3D11DeviceContext> = None;
        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_FLAG(0),
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
            .map_err(|e| anyhow!("D3D11CreateDevice: {e}"))?;
        }
        let device = device.ok_or_else(|| anyhow!("D3D11CreateDevice returned no device"))?;
        let context = context.ok_or_else(|| anyhow!("D3D11CreateDevice returned no context"))?;

        let mut this = Self {
            device,
            context,
            duplication: None,
            staging: None,
            width,
            height,
        };
        this.recreate_duplication()?;
        Ok(this)
    }

    fn recreate_duplication(&mut self) -> Result<()> {
        self.duplication = None;

        unsafe {
            let dxgi_device: IDXGIDevice = self
                .device
                .cast()
                .map_err(|e| anyhow!("query IDXGIDevice: {e}"))?;
            let adapter = dxgi_device
                .GetAdapter()
                .map_err(|e| anyhow!("GetAdapter: {e}"))?;
            let output = adapter
                .EnumOutputs(0)
                .map_err(|e| anyhow!("EnumOutputs(0): {e}"))?;
            let output1: IDXGIOutput1 = output
                .cast()
                .map_err(|e| anyhow!("query IDXGIOutput1: {e}"))?;
            let duplication = output1
                .DuplicateOutput(&self.device)
                .map_err(|e| anyhow!("DuplicateOutput: {e}"))?;
            self.duplication = Some(duplication);
        }
        log::info!("[duplication] output duplication (re)created");
        Ok(())
    }

    fn ensure_staging(&mut self, desc: &D3D11_TEXTURE2D_DESC) -> Result<ID3D11Texture2D> {
        if let Some(staging) = &self.staging {
            return Ok(staging.clone());
        }
        let staging_desc = D3D11_TEXTURE2D_DESC {
            Usage: D3D11_USAGE_STAGING,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            BindFlags: 0,
            MiscFlags: 0,
            ..*desc
        };
        let mut staging: Option<ID3D11Texture2D> = None;
        unsafe {
            self.device
                .CreateTexture2D(&staging_desc, None, Some(&mut staging))
                .map_err(|e| anyhow!("CreateTexture2D (staging): {e}"))?;
        }
        let staging = staging.ok_or_else(|| anyhow!("staging texture not created"))?;
        self.staging = Some(staging.clone());
        Ok(staging)
    }
}

impl DesktopSource for DxgiDuplication {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn acquire_frame(&mut self, out: &mut [u8], timeout: Duration) -> Result<bool> {
        let duplication = match &self.duplication {
            Some(d) => d.clone(),
            None => {
                self.recreate_duplication()?;
                return Ok(false);
            }
        };

        let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;

        let acquired = unsafe {
            duplication.AcquireNextFrame(
                timeout.as_millis() as u32,
                &mut frame_info,
                &mut resource,
            )
        };

        if let Err(e) = acquired {
            if e.code() == DXGI_ERROR_WAIT_TIMEOUT {
                return Ok(false);
            }
            if e.code() == DXGI_ERROR_ACCESS_LOST {
                log::warn!("[duplication] access lost, recreating");
                self.recreate_duplication()?;
                return Ok(false);
            }
            return Err(anyhow!("AcquireNextFrame: {e}"));
        }

        let result = (|| -> Result<bool> {
            let resource = resource.ok_or_else(|| anyhow!("no resource from AcquireNextFrame"))?;
            let texture: ID3D11Texture2D = unsafe {
                resource.cast().map_err(|e| anyhow!("frame texture: {e}"))?
            };

            let mut desc = D3D11_TEXTURE2D_DESC::default();
            unsafe { texture.GetDesc(&mut desc) };
            if desc.Width < self.width || desc.Height < self.height {
                return Err(anyhow!(
                    "duplicated output is {}x{}, smaller than requested {}x{}",
                    desc.Width,
                    desc.Height,
                    self.width,
                    self.height
                ));
            }

            let staging = self.ensure_staging(&desc)?;
            unsafe {
                self.context.CopyResource(&staging, &texture);

                let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
                self.context
                    .Map(&staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                    .map_err(|e| anyhow!("Map staging texture: {e}"))?;

                let pitch = mapped.RowPitch as usize;
                let src = std::slice::from_raw_parts(
                    mapped.pData as *const u8,
                    pitch * desc.Height as usize,
                );
                bgra_to_rgba_packed(src, pitch, self.width, self.height, out);

                self.context.Unmap(&staging, 0);
            }
            Ok(true)
        })();

        unsafe {
            let _ = duplication.ReleaseFrame();
        }
        result
    }
}
