use crate::block::block_core::Block;
use crate::mem::frame_pool::PagePool;
use crate::mem::frame_table::FrameTable;
use crate::mem::page_replacement::Clock;
use crate::mem::swapping::SwapSpace;
use crate::user_program::process::{Pid, Process};
use alloc::{boxed::Box, sync::Arc};
use once_cell::race::OnceBox;

/// The memory state shared by every process.
pub struct VmSystem {
    pub pool: Arc<dyn PagePool>,
    pub swap: Arc<SwapSpace>,
    pub frames: Arc<FrameTable>,
}

impl VmSystem {
    pub fn new(pool: Arc<dyn PagePool>, swap_block: Block) -> Self {
        let swap = Arc::new(SwapSpace::new(swap_block));
        let frames: FrameTable<Clock> = FrameTable::new(pool.clone(), swap.clone());
        Self {
            pool,
            swap,
            frames: Arc::new(frames),
        }
    }

    /// A new process drawing its frames from this system.
    pub fn new_process(&self, pid: Pid) -> Process {
        Process::new(pid, self.frames.clone())
    }
}

static SYSTEM: OnceBox<VmSystem> = OnceBox::new();

/// Bring up the global memory state. Only the first call takes effect.
pub fn init(pool: Arc<dyn PagePool>, swap_block: Block) -> &'static VmSystem {
    let mut fresh = false;
    let system = SYSTEM.get_or_init(|| {
        fresh = true;
        Box::new(VmSystem::new(pool, swap_block))
    });
    if fresh {
        log::info!(
            "VM up: {} frames, {} swap slots",
            system.pool.capacity(),
            system.swap.slots()
        );
    } else {
        log::warn!("VM system initialized twice, keeping the first");
    }
    system
}

pub fn unwrap_system() -> &'static VmSystem {
    SYSTEM.get().expect("VM system not initialized.")
}
