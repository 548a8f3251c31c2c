//! Guest image loading

use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::info;
use vm_memory::{Address, Bytes, GuestAddress, GuestMemoryMmap};

use crate::vmm::kvm::layout;
use crate::Result;

/// Stream a flat binary into guest memory starting at guest-physical
/// address 0.
///
/// The image is copied verbatim in fixed-size chunks until end-of-file and
/// the number of bytes loaded is returned. An image that does not fit in the
/// installed region fails with [`crate::Error::ImageOverflow`] at the first
/// chunk past the end.
///
/// The guest memory region is shared with the guest once it runs: callers
/// must not load (or otherwise write) after the first run call.
pub fn load_image<P: AsRef<Path>>(memory: &GuestMemoryMmap, path: P) -> Result<usize> {
    let path = path.as_ref();
    let mut file = File::open(path)?;

    let mut chunk = [0u8; layout::IMAGE_CHUNK_SIZE];
    let mut loaded = 0usize;
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }

        let addr = GuestAddress(layout::RAM_START.raw_value() + loaded as u64);
        memory
            .write_slice(&chunk[..n], addr)
            .map_err(|source| crate::Error::ImageOverflow {
                offset: addr.raw_value(),
                source,
            })?;
        loaded += n;
    }

    info!("Loaded {} byte image from {}", loaded, path.display());
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::io::Write;

    fn create_test_memory(size: usize) -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size)]).unwrap()
    }

    fn write_image(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_copies_image_byte_for_byte() {
        let memory = create_test_memory(64 * 1024);
        let image: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let file = write_image(&image);

        let loaded = load_image(&memory, file.path()).unwrap();
        assert_eq!(loaded, image.len());

        let mut readback = vec![0u8; image.len()];
        memory.read_slice(&mut readback, GuestAddress(0)).unwrap();
        assert_eq!(readback, image);
    }

    #[test]
    fn test_load_spans_chunk_boundaries() {
        let memory = create_test_memory(64 * 1024);
        // Larger than two chunks, with a ragged tail.
        let image = vec![0xa5u8; 2 * layout::IMAGE_CHUNK_SIZE + 17];
        let file = write_image(&image);

        assert_eq!(load_image(&memory, file.path()).unwrap(), image.len());

        let mut readback = vec![0u8; image.len()];
        memory.read_slice(&mut readback, GuestAddress(0)).unwrap();
        assert_eq!(readback, image);
    }

    #[test]
    fn test_load_empty_image() {
        let memory = create_test_memory(4096);
        let file = write_image(&[]);
        assert_eq!(load_image(&memory, file.path()).unwrap(), 0);
    }

    #[test]
    fn test_oversize_image_is_rejected() {
        let memory = create_test_memory(layout::IMAGE_CHUNK_SIZE);
        let image = vec![0xf4u8; 3 * layout::IMAGE_CHUNK_SIZE];
        let file = write_image(&image);

        match load_image(&memory, file.path()) {
            Err(Error::ImageOverflow { .. }) => {}
            other => panic!("expected ImageOverflow, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_image_is_an_io_error() {
        let memory = create_test_memory(4096);
        match load_image(&memory, "/nonexistent/guest.bin") {
            Err(Error::Image(_)) => {}
            other => panic!("expected Image error, got {:?}", other),
        }
    }
}
