//! Presentation backend backed by anonymous memory.
//!
//! Each swapchain image is a `memfd` sized for the requested extent, so
//! descriptors handed to clients can be mapped and written like real image
//! memory. There is no GPU work, so waits complete immediately.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use halo_ipc::types::SwapchainCreateInfo;
use tracing::debug;

use super::{BackendError, CompositorBackend, Swapchain, SwapchainImage};
use crate::config::CompositorConfig;

// Vulkan format numbers
pub const FORMAT_R8G8B8A8_UNORM: i64 = 37;
pub const FORMAT_R8G8B8A8_SRGB: i64 = 43;
pub const FORMAT_B8G8R8A8_UNORM: i64 = 44;
pub const FORMAT_B8G8R8A8_SRGB: i64 = 50;
pub const FORMAT_R16G16B16A16_SFLOAT: i64 = 97;

fn bytes_per_pixel(format: i64) -> u64 {
    match format {
        FORMAT_R16G16B16A16_SFLOAT => 8,
        _ => 4,
    }
}

pub struct MemfdCompositor {
    formats: Vec<i64>,
    image_count: u32,
}

impl MemfdCompositor {
    pub fn new(config: &CompositorConfig) -> Self {
        Self {
            formats: config.formats.clone(),
            image_count: config.image_count,
        }
    }
}

impl CompositorBackend for MemfdCompositor {
    fn formats(&self) -> Vec<i64> {
        self.formats.clone()
    }

    fn create_swapchain(&self, info: &SwapchainCreateInfo) -> Result<Box<dyn Swapchain>, BackendError> {
        if !self.formats.contains(&info.format) {
            return Err(BackendError::UnsupportedFormat(info.format));
        }
        if info.width == 0 || info.height == 0 {
            return Err(BackendError::InvalidParameters("zero extent"));
        }
        if info.array_size == 0 || info.face_count == 0 || info.mip_count == 0 {
            return Err(BackendError::InvalidParameters("zero layer, face or mip count"));
        }

        let size = [info.height, info.array_size, info.face_count]
            .into_iter()
            .try_fold(info.width as u64 * bytes_per_pixel(info.format), |acc, n| {
                acc.checked_mul(n as u64)
            })
            .filter(|&size| libc::off_t::try_from(size).is_ok())
            .ok_or(BackendError::InvalidParameters("extent too large"))?;

        let images = (0..self.image_count)
            .map(|i| allocate_image(&format!("halo-swapchain-{}", i), size))
            .collect::<io::Result<Vec<_>>>()?;

        debug!(
            "Allocated {} images of {} bytes ({}x{}, format {})",
            images.len(),
            size,
            info.width,
            info.height,
            info.format
        );

        Ok(Box::new(MemfdSwapchain {
            states: vec![ImageState::Free; images.len()],
            images,
            next: 0,
        }))
    }
}

fn allocate_image(name: &str, size: u64) -> io::Result<SwapchainImage> {
    let c_name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid name"))?;
    let raw = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(SwapchainImage { fd, size })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageState {
    Free,
    Acquired,
    Waited,
}

struct MemfdSwapchain {
    images: Vec<SwapchainImage>,
    states: Vec<ImageState>,
    /// Round-robin acquire cursor
    next: usize,
}

impl MemfdSwapchain {
    fn state_mut(&mut self, index: u32) -> Result<&mut ImageState, BackendError> {
        self.states
            .get_mut(index as usize)
            .ok_or(BackendError::InvalidImage(index))
    }
}

impl Swapchain for MemfdSwapchain {
    fn images(&self) -> &[SwapchainImage] {
        &self.images
    }

    fn wait_image(&mut self, _timeout_ns: u64, index: u32) -> Result<(), BackendError> {
        let state = self.state_mut(index)?;
        match *state {
            ImageState::Free => Err(BackendError::NotAcquired(index)),
            _ => {
                *state = ImageState::Waited;
                Ok(())
            }
        }
    }

    fn acquire_image(&mut self) -> Result<u32, BackendError> {
        let n = self.states.len();
        for offset in 0..n {
            let i = (self.next + offset) % n;
            if self.states[i] == ImageState::Free {
                self.states[i] = ImageState::Acquired;
                self.next = (i + 1) % n;
                return Ok(i as u32);
            }
        }
        Err(BackendError::NoImageAvailable)
    }

    fn release_image(&mut self, index: u32) -> Result<(), BackendError> {
        let state = self.state_mut(index)?;
        if *state == ImageState::Free {
            return Err(BackendError::NotAcquired(index));
        }
        *state = ImageState::Free;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::create_info;

    fn backend() -> MemfdCompositor {
        MemfdCompositor::new(&CompositorConfig::default())
    }

    #[test]
    fn test_images_sized_for_extent() {
        let sc = backend().create_swapchain(&create_info(64, 32)).unwrap();
        assert_eq!(sc.image_count(), 3);
        for image in sc.images() {
            assert_eq!(image.size, 64 * 32 * 4);
            let file = std::fs::File::from(image.fd.try_clone().unwrap());
            assert_eq!(file.metadata().unwrap().len(), 64 * 32 * 4);
        }
    }

    #[test]
    fn test_unsupported_format() {
        let mut info = create_info(8, 8);
        info.format = 12345;
        assert!(matches!(
            backend().create_swapchain(&info),
            Err(BackendError::UnsupportedFormat(12345))
        ));
    }

    #[test]
    fn test_oversized_extent_rejected() {
        let mut info = create_info(u32::MAX, u32::MAX);
        info.array_size = u32::MAX;
        info.face_count = u32::MAX;
        assert!(matches!(
            backend().create_swapchain(&info),
            Err(BackendError::InvalidParameters(_))
        ));

        // Fits in u64 but not in a file size
        let mut info = create_info(1 << 20, 1 << 20);
        info.array_size = 1 << 21;
        assert!(matches!(
            backend().create_swapchain(&info),
            Err(BackendError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_acquire_release_cycle() {
        let mut sc = backend().create_swapchain(&create_info(8, 8)).unwrap();
        assert_eq!(sc.acquire_image().unwrap(), 0);
        assert_eq!(sc.acquire_image().unwrap(), 1);
        assert_eq!(sc.acquire_image().unwrap(), 2);
        assert!(matches!(sc.acquire_image(), Err(BackendError::NoImageAvailable)));

        sc.wait_image(0, 1).unwrap();
        sc.release_image(1).unwrap();
        assert_eq!(sc.acquire_image().unwrap(), 1);

        assert!(matches!(sc.release_image(7), Err(BackendError::InvalidImage(7))));
    }

    #[test]
    fn test_wait_requires_acquire() {
        let mut sc = backend().create_swapchain(&create_info(8, 8)).unwrap();
        assert!(matches!(sc.wait_image(0, 0), Err(BackendError::NotAcquired(0))));
    }
}
