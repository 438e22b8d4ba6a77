//! The memory-facing half of a user process: its page tables, mappings,
//! open files and executable.

use super::loader::{load_elf, ElfError, LoadedImage};
use crate::mem::{
    self,
    fault::handle_user_fault,
    frame_table::FrameTable,
    mmap::{MapId, MmapTable, MAP_FAILED},
    page_table::SupplementalPageTable,
    user::copy_to_user,
};
use crate::paging::{AddressSpace, PageMap};
use crate::sync::mutex::Mutex;
use crate::vfs::{self, FileRef};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use kidneyos_vm_shared::mem::PAGE_FRAME_SIZE;

pub type Pid = u32;

/// Descriptors below this belong to the console.
pub const FIRST_FD: i32 = 3;
/// One past the largest descriptor.
pub const MAX_OPEN_FILES: i32 = 128;

const MAX_ARGUMENTS: usize = 256;

/// Writes downwards from a stack pointer without leaving one stack page.
struct UserStack<'a> {
    pages: &'a SupplementalPageTable,
    floor: usize,
    esp: usize,
}

impl UserStack<'_> {
    fn push(&mut self, bytes: &[u8]) -> Option<usize> {
        let top = self
            .esp
            .checked_sub(bytes.len())
            .filter(|top| *top >= self.floor)?;
        copy_to_user(self.pages, top, bytes).ok()?;
        self.esp = top;
        Some(top)
    }

    fn push_u32(&mut self, value: u32) -> Option<usize> {
        self.push(&value.to_le_bytes())
    }
}

/// Push `arguments` onto the user stack that starts at `esp`, in the C
/// calling convention: the strings, `argv`, then `argv`, `argc` and a null
/// return address. Everything must fit in the stack page below `esp`.
///
/// Returns the new stack pointer.
fn move_arguments_to_stack(
    pages: &SupplementalPageTable,
    esp: usize,
    arguments: &[&str],
) -> Option<usize> {
    if arguments.len() > MAX_ARGUMENTS {
        return None;
    }
    let mut stack = UserStack {
        pages,
        floor: esp.checked_sub(PAGE_FRAME_SIZE)?,
        esp,
    };

    let mut argv = Vec::with_capacity(arguments.len() + 1);
    for arg in arguments.iter().rev() {
        stack.push(&[0])?;
        argv.push(u32::try_from(stack.push(arg.as_bytes())?).ok()?);
    }
    argv.reverse();
    argv.push(0);

    // Align to the word size.
    let padding = stack.esp % 4;
    stack.push(&[0; 4][..padding])?;

    let mut array = Vec::with_capacity(argv.len() * 4);
    for pointer in &argv {
        array.extend_from_slice(&pointer.to_le_bytes());
    }
    let argv_address = u32::try_from(stack.push(&array)?).ok()?;
    stack.push_u32(argv_address)?;
    stack.push_u32(u32::try_from(arguments.len()).ok()?)?;
    stack.push_u32(0)
}

pub struct Process {
    pid: Pid,
    space: Arc<PageMap>,
    pages: SupplementalPageTable,
    mmaps: Mutex<MmapTable>,
    files: Mutex<BTreeMap<i32, FileRef>>,
    /// Kept open with writes denied while the process runs.
    executable: Mutex<Option<FileRef>>,
}

impl Process {
    pub fn new(pid: Pid, frames: Arc<FrameTable>) -> Self {
        let space = Arc::new(PageMap::new(pid));
        let pages = SupplementalPageTable::new(space.clone(), frames);
        Self {
            pid,
            space,
            pages,
            mmaps: Mutex::new(MmapTable::new()),
            files: Mutex::new(BTreeMap::new()),
            executable: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn space(&self) -> &Arc<PageMap> {
        &self.space
    }

    pub fn pages(&self) -> &SupplementalPageTable {
        &self.pages
    }

    /// Install `file` at the lowest free descriptor.
    pub fn open_file(&self, file: FileRef) -> vfs::Result<i32> {
        let mut files = self.files.lock();
        let fd = (FIRST_FD..MAX_OPEN_FILES)
            .find(|fd| !files.contains_key(fd))
            .ok_or(vfs::Error::TooManyOpenFiles)?;
        files.insert(fd, file);
        Ok(fd)
    }

    pub fn file(&self, fd: i32) -> vfs::Result<FileRef> {
        self.files
            .lock()
            .get(&fd)
            .cloned()
            .ok_or(vfs::Error::BadDescriptor)
    }

    pub fn close_file(&self, fd: i32) -> vfs::Result<()> {
        self.files
            .lock()
            .remove(&fd)
            .map(|_| ())
            .ok_or(vfs::Error::BadDescriptor)
    }

    /// Load the executable in `file`, lazily, and push `arguments` onto the
    /// new stack. Writes to the file are denied until the process exits.
    pub fn load_executable(
        &self,
        file: &FileRef,
        arguments: &[&str],
    ) -> Result<LoadedImage, ElfError> {
        let file = file.reopen()?;
        file.deny_write();
        if let Some(previous) = self.executable.lock().replace(file.clone()) {
            previous.allow_write();
        }

        let mut image = load_elf(&self.pages, &file)?;
        image.stack_pointer = move_arguments_to_stack(&self.pages, image.stack_pointer, arguments)
            .ok_or(ElfError::ArgumentsTooLong)?;
        log::debug!(
            "process {} starts at {:#X} with esp {:#X}",
            self.pid,
            image.entry,
            image.stack_pointer
        );
        Ok(image)
    }

    /// Resolve a page fault taken in user mode with stack pointer `esp`.
    pub fn handle_page_fault(&self, addr: usize, write: bool, esp: usize) -> mem::Result<()> {
        handle_user_fault(&self.pages, addr, write, esp)
    }

    /// The `mmap` system call. Returns the new mapping id, or [`MAP_FAILED`].
    pub fn mmap(&self, fd: i32, addr: usize) -> i32 {
        if !(FIRST_FD..MAX_OPEN_FILES).contains(&fd) {
            return MAP_FAILED;
        }
        let Ok(file) = self.file(fd) else {
            return MAP_FAILED;
        };
        self.mmaps
            .lock()
            .map(&self.pages, &file, addr)
            .and_then(|id| i32::try_from(id.get()).ok())
            .unwrap_or(MAP_FAILED)
    }

    /// The `munmap` system call. Unknown ids are ignored.
    pub fn munmap(&self, id: i32) {
        let Ok(id) = u32::try_from(id) else {
            return;
        };
        if let Err(err) = self.mmaps.lock().unmap(&self.pages, MapId::new(id)) {
            log::error!("process {}: munmap({}) lost data: {}", self.pid, id, err);
        }
    }

    /// Tear down the address space: write back and drop every mapping,
    /// release every page, close every file.
    pub fn exit(&self) {
        if let Err(err) = self.mmaps.lock().unmap_all(&self.pages) {
            log::error!("process {}: write-back on exit failed: {}", self.pid, err);
        }
        self.pages.destroy();
        if let Some(executable) = self.executable.lock().take() {
            executable.allow_write();
        }
        self.files.lock().clear();
        log::trace!(
            "process {} exited, {} mappings left in space {}",
            self.pid,
            self.space.mapped(),
            self.space.id()
        );
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.exit();
    }
}
