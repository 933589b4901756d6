//! Bounded arena allocator for JITs.
//!
//! Regions are mapped on demand until the configured capacity is reached, after which allocations
//! fail with [`AllocError::Exhausted`]. [`Allocator::reset`] releases every region at once.
use easyerr::Error;
use std::marker::PhantomData;
use std::ptr::NonNull;

#[cfg(target_family = "unix")]
use rustix::mm::{self as mman, MapFlags, ProtFlags};
#[cfg(target_family = "windows")]
use windows::Win32::System::{
    Diagnostics::Debug::FlushInstructionCache, Memory, Threading::GetCurrentProcess,
};

const REGION_MIN_LEN: usize = 1 << 16;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("arena capacity exhausted")]
    Exhausted,
    #[error("failed to map a region")]
    Map,
    #[error("failed to change the protection of a region")]
    Protect,
}

/// A memory mapped region.
#[derive(Clone, Copy)]
struct Region {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: changing the protection can be done from any thread
unsafe impl Send for Region {}

impl Region {
    fn new(addr_hint: Option<usize>, len: usize) -> Result<Self, AllocError> {
        #[cfg(target_family = "unix")]
        let region = unsafe {
            mman::mmap_anonymous(
                addr_hint
                    .map(std::ptr::without_provenance_mut)
                    .unwrap_or_default(),
                len,
                ProtFlags::empty(),
                MapFlags::PRIVATE,
            )
        }
        .map_err(|_| AllocError::Map)?;

        #[cfg(target_family = "windows")]
        let region = unsafe {
            let addr_hint_ptr = addr_hint.map(|addr| std::ptr::without_provenance(addr));
            let result = Memory::VirtualAlloc(
                addr_hint_ptr,
                len,
                Memory::MEM_RESERVE | Memory::MEM_COMMIT,
                Memory::PAGE_NOACCESS,
            );

            let result = if !result.is_null() {
                result
            } else {
                Memory::VirtualAlloc(
                    None,
                    len,
                    Memory::MEM_RESERVE | Memory::MEM_COMMIT,
                    Memory::PAGE_NOACCESS,
                )
            };

            if result.is_null() {
                return Err(AllocError::Map);
            }

            result
        };

        Ok(Self {
            ptr: region.cast(),
            len,
        })
    }

    unsafe fn protect(&self, length: usize, protection: Protection) -> Result<(), AllocError> {
        #[cfg(target_family = "unix")]
        unsafe {
            use rustix::mm::MprotectFlags;

            let flags = match protection {
                Protection::ReadExec => MprotectFlags::READ | MprotectFlags::EXEC,
                Protection::ReadWrite => MprotectFlags::READ | MprotectFlags::WRITE,
            };

            mman::mprotect(self.ptr.cast(), length, flags).map_err(|_| AllocError::Protect)
        }

        #[cfg(target_family = "windows")]
        unsafe {
            let mut previous = Memory::PAGE_PROTECTION_FLAGS(0);
            let flags = match protection {
                Protection::ReadExec => Memory::PAGE_EXECUTE_READ,
                Protection::ReadWrite => Memory::PAGE_READWRITE,
            };

            Memory::VirtualProtect(self.ptr.cast(), length, flags, &raw mut previous)
                .map_err(|_| AllocError::Protect)
        }
    }

    /// # Safety
    /// No allocation from this region may be used afterwards.
    unsafe fn release(self) {
        #[cfg(target_family = "unix")]
        unsafe {
            if mman::munmap(self.ptr.cast(), self.len).is_err() {
                tracing::warn!(len = self.len, "failed to release a region");
            }
        }

        #[cfg(target_family = "windows")]
        unsafe {
            if Memory::VirtualFree(self.ptr.cast(), 0, Memory::MEM_RELEASE).is_err() {
                tracing::warn!(len = self.len, "failed to release a region");
            }
        }
    }
}

/// # Safety considerations
/// The allocator this allocation comes from must not be modified while the allocation
/// is accessed. This is specially important for multi-threaded contexts. Resetting the allocator
/// invalidates every allocation it handed out.
pub struct Allocation<K>(NonNull<[u8]>, PhantomData<K>);

impl<K> Allocation<K> {
    /// Returns a pointer to the allocation.
    ///
    /// # Safety
    /// In order to access the data behind the pointer, accesses to the underlying allocator must
    /// be synchronized, as stated in the type docs.
    #[inline(always)]
    pub unsafe fn as_ptr(&self) -> NonNull<[u8]> {
        self.0
    }
}

// SAFETY: safe to send to another thread as long as accesses to the allocation are synchronized
// with accesses to the allocator, which is the user's responsibility
unsafe impl<K> Send for Allocation<K> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadExec,
    ReadWrite,
}

pub trait AllocKind {
    const PROTECTION: Protection;
}

pub struct Exec;
impl AllocKind for Exec {
    const PROTECTION: Protection = Protection::ReadExec;
}

pub struct ReadWrite;
impl AllocKind for ReadWrite {
    const PROTECTION: Protection = Protection::ReadWrite;
}

pub struct Allocator<K> {
    /// Every mapped region, the last one being the active one
    regions: Vec<Region>,
    /// Offset into the active region
    offset: usize,
    /// Total amount of bytes that may be mapped
    capacity: usize,
    /// Amount of bytes currently mapped
    mapped: usize,
    /// Phantom
    _phantom: PhantomData<K>,
}

impl<K> Allocator<K>
where
    K: AllocKind,
{
    /// Creates an allocator which maps at most `capacity` bytes.
    #[inline(always)]
    pub const fn new(capacity: usize) -> Self {
        Self {
            regions: Vec::new(),
            offset: 0,
            capacity,
            mapped: 0,
            _phantom: PhantomData,
        }
    }

    /// Total amount of bytes this allocator may map.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Amount of bytes handed out from the active region plus every full region before it.
    pub fn used(&self) -> usize {
        let full: usize = self
            .regions
            .iter()
            .rev()
            .skip(1)
            .map(|region| region.len)
            .sum();

        full + self.offset
    }

    fn map_region(&mut self, length: usize) -> Result<Region, AllocError> {
        let len = length.max(REGION_MIN_LEN).min(self.capacity - self.mapped);
        if len < length {
            return Err(AllocError::Exhausted);
        }

        let hint = self
            .regions
            .last()
            .map(|region| unsafe { region.ptr.add(region.len) }.addr());

        let region = Region::new(hint, len)?;
        self.regions.push(region);
        self.mapped += len;
        self.offset = 0;

        Ok(region)
    }

    fn allocate_inner(
        &mut self,
        alignment: usize,
        length: usize,
    ) -> Result<(Region, Allocation<K>), AllocError> {
        assert!(length > 0);

        let alignment = alignment.max(1).next_power_of_two();
        let mut effective_offset = self.offset.next_multiple_of(alignment);

        let region = match self.regions.last().copied() {
            Some(region)
                if region
                    .len
                    .checked_sub(effective_offset)
                    .is_some_and(|r| r >= length) =>
            {
                region
            }
            _ => {
                let region = self.map_region(length)?;
                effective_offset = 0;
                region
            }
        };

        let start = unsafe { region.ptr.add(effective_offset) };
        self.offset = effective_offset + length;

        let start = NonNull::new(start.cast()).ok_or(AllocError::Map)?;
        Ok((
            region,
            Allocation(NonNull::slice_from_raw_parts(start, length), PhantomData),
        ))
    }

    pub fn allocate_uninit(
        &mut self,
        alignment: usize,
        length: usize,
    ) -> Result<Allocation<K>, AllocError> {
        let (region, alloc) = self.allocate_inner(alignment, length)?;
        unsafe { region.protect(self.offset, K::PROTECTION)? };

        Ok(alloc)
    }

    pub fn allocate(&mut self, alignment: usize, data: &[u8]) -> Result<Allocation<K>, AllocError> {
        let (region, alloc) = self.allocate_inner(alignment, data.len())?;

        unsafe {
            region.protect(self.offset, Protection::ReadWrite)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), alloc.0.as_ptr().cast(), data.len());
            if K::PROTECTION != Protection::ReadWrite {
                region.protect(self.offset, K::PROTECTION)?;
            }

            #[cfg(target_family = "windows")]
            {
                let process = GetCurrentProcess();
                FlushInstructionCache(process, Some(alloc.0.as_ptr().cast()), data.len())
                    .map_err(|_| AllocError::Protect)?;
            }
        }

        Ok(alloc)
    }

    /// Releases every region.
    ///
    /// # Safety
    /// No allocation handed out by this allocator may be used afterwards.
    pub unsafe fn reset(&mut self) {
        for region in self.regions.drain(..) {
            unsafe { region.release() };
        }

        self.offset = 0;
        self.mapped = 0;
    }
}

impl<K> Drop for Allocator<K> {
    fn drop(&mut self) {
        for region in self.regions.drain(..) {
            unsafe { region.release() };
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capacity_is_enforced() {
        let mut alloc = Allocator::<ReadWrite>::new(REGION_MIN_LEN);
        let first = alloc.allocate(16, &[1; 1024]).unwrap();
        assert_eq!(unsafe { first.as_ptr() }.len(), 1024);

        let fill = REGION_MIN_LEN - 1024;
        alloc.allocate_uninit(1, fill).unwrap();
        assert_eq!(alloc.used(), REGION_MIN_LEN);

        assert_eq!(
            alloc.allocate(16, &[0; 16]).err(),
            Some(AllocError::Exhausted)
        );
    }

    #[test]
    fn data_is_copied() {
        let mut alloc = Allocator::<ReadWrite>::new(1 << 20);
        let data = [0xAB_u8, 0xCD, 0xEF];
        let a = alloc.allocate(64, &data).unwrap();

        let ptr = unsafe { a.as_ptr() };
        assert_eq!(ptr.cast::<u8>().as_ptr().addr() % 64, 0);
        assert_eq!(unsafe { ptr.as_ref() }, &data);
    }

    #[test]
    fn reset_releases_everything() {
        let mut alloc = Allocator::<Exec>::new(2 * REGION_MIN_LEN);
        alloc.allocate(64, &[0xC3; 100]).unwrap();
        alloc.allocate_uninit(64, REGION_MIN_LEN).unwrap();
        assert!(alloc.allocate_uninit(64, REGION_MIN_LEN).is_err());

        unsafe { alloc.reset() };
        assert_eq!(alloc.used(), 0);
        alloc.allocate_uninit(64, REGION_MIN_LEN).unwrap();
    }
}
