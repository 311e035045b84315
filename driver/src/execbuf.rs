// Execbuffer: command-stream submission
//
// Validates a user batch, makes every referenced object resident, patches
// relocations with final GTT addresses, switches the engine to the target
// context, and emits the batch start plus a seqno store. The returned seqno
// is the caller's sync token.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::bo::{Bo, CompletedSeqnos, GemManager};
use crate::context::Context;
use crate::engine::{Engine, MI_BATCH_BUFFER_START, MI_SET_CONTEXT};
use crate::errors::{GfxError, Result};
use crate::{CacheType, PAGE_SIZE};

/// A relocation whose target handle has already been resolved.
pub struct ResolvedReloc {
    pub target: Arc<Bo>,
    /// Byte offset of the dword to patch inside the command buffer.
    pub offset: u32,
    pub delta: u32,
    pub write: bool,
}

/// Bind `bo` if it is not resident, remembering fresh binds in `bound_now`
/// so a failing submission can unwind exactly what it bound.
fn ensure_bound(
    gem: &Arc<GemManager>,
    bo: &Arc<Bo>,
    cache: CacheType,
    completed: CompletedSeqnos,
    bound_now: &mut Vec<Arc<Bo>>,
) -> Result<u64> {
    let was_bound = bo.is_bound();
    let offset_pages = gem.bind(bo, cache, completed)?;
    if !was_bound {
        bound_now.push(bo.clone());
    }
    Ok(offset_pages as u64 * PAGE_SIZE as u64)
}

fn unwind(gem: &Arc<GemManager>, bound_now: &[Arc<Bo>]) {
    for bo in bound_now {
        gem.unbind(bo);
    }
}

/// Submit `cmd_bo[..length]` on `engine`. Returns the freshly minted seqno.
pub fn submit(
    gem: &Arc<GemManager>,
    engine: &Engine,
    cmd_bo: &Arc<Bo>,
    length: usize,
    relocs: &[ResolvedReloc],
    context: Option<&Arc<Context>>,
    completed: CompletedSeqnos,
) -> Result<u32> {
    if length == 0 || length % 4 != 0 || length > cmd_bo.allocated_size() {
        return Err(GfxError::BadValue);
    }
    for reloc in relocs {
        if reloc.offset as usize + 4 > length {
            return Err(GfxError::BadValue);
        }
    }

    let _submit = engine.submit_lock.lock();
    let mut bound_now: Vec<Arc<Bo>> = Vec::new();

    // Command buffers bind uncached; relocation targets keep their own
    // cache hint. Already-resident objects are accepted at their current
    // binding (the pin is promoted), even with a different cache type.
    let batch_address = match ensure_bound(gem, cmd_bo, CacheType::Uncached, completed, &mut bound_now)
    {
        Ok(address) => address,
        Err(e) => {
            unwind(gem, &bound_now);
            return Err(e);
        }
    };
    let mut target_addresses = Vec::with_capacity(relocs.len());
    for reloc in relocs {
        match ensure_bound(gem, &reloc.target, CacheType::Default, completed, &mut bound_now) {
            Ok(address) => target_addresses.push(address),
            Err(e) => {
                unwind(gem, &bound_now);
                return Err(e);
            }
        }
    }

    // Patch relocated dwords with final GTT addresses.
    let cmd_virt = match cmd_bo.cpu_map() {
        Ok(virt) => virt,
        Err(e) => {
            unwind(gem, &bound_now);
            return Err(e);
        }
    };
    for (reloc, address) in relocs.iter().zip(target_addresses.iter()) {
        let value = (*address as u32).wrapping_add(reloc.delta);
        unsafe {
            ((cmd_virt.as_u64() + reloc.offset as u64) as *mut u32).write_volatile(value);
        }
    }

    let mut commands: Vec<u32> = Vec::with_capacity(16);

    if let Some(context) = context {
        if engine.current_context() != Some(context.id()) {
            let image = match context.image_gtt_address() {
                Some(address) => address,
                None => {
                    unwind(gem, &bound_now);
                    return Err(GfxError::NotReady);
                }
            };
            commands.push(MI_SET_CONTEXT);
            commands.push(image as u32);
        }
    }

    let seqno = engine.mint_seqno();
    commands.push(MI_BATCH_BUFFER_START);
    commands.push(batch_address as u32);
    engine.seqno_store_commands(seqno, &mut commands);

    if let Err(e) = engine.emit(&commands) {
        unwind(gem, &bound_now);
        return Err(e);
    }

    if let Some(context) = context {
        engine.set_current_context(Some(context.id()));
        context.record_submission(engine.id(), seqno);
    }

    // Retire bookkeeping: every referenced object was just used.
    gem.mark_used(cmd_bo, engine.id(), seqno);
    for reloc in relocs {
        gem.mark_used(&reloc.target, engine.id(), seqno);
        if reloc.write {
            reloc.target.mark_dirty();
        }
    }

    Ok(seqno)
}

/// Emit only the seqno store: establishes a fence point with no real work.
pub fn flush_and_get_seqno(engine: &Engine) -> Result<u32> {
    let _submit = engine.submit_lock.lock();
    let seqno = engine.mint_seqno();
    let mut commands: Vec<u32> = Vec::with_capacity(8);
    engine.seqno_store_commands(seqno, &mut commands);
    engine.emit(&commands)?;
    Ok(seqno)
}
