//! Per-image patch recipes.
//!
//! Each recipe locates its sites through the analyser and stages
//! instruction writes; none of them touch files directly. Sites that
//! only exist on some platform versions degrade to a warning when
//! absent, everything else is fatal.

use tracing::{info, warn};

use crate::analyser::{CacheAnalyser, Image, ImageMatcher};
use crate::arm64::{self, Assembler, MovzShift, Reg};
use crate::error::Result;
use crate::patcher::Patcher;

/// Applies every software-rendering patch recipe.
pub fn apply_all(
    analyser: &CacheAnalyser,
    patcher: &mut Patcher,
    unredact_logs: bool,
) -> Result<()> {
    core_image(analyser, patcher)?;
    quartz_core(analyser, patcher)?;
    springboard_foundation(analyser, patcher)?;
    cm_capture(analyser, patcher)?;
    telephony_util(analyser, patcher)?;
    neutrino_core(analyser, patcher)?;
    if unredact_logs {
        libsystem_trace(analyser, patcher)?;
    }
    Ok(())
}

/// CoreImage: report OpenGL as unusable so software rendering wins, and
/// lift the software-rendering allow-list checks newer builds added.
fn core_image(analyser: &CacheAnalyser, patcher: &mut Patcher) -> Result<()> {
    let image = analyser.find_image(&ImageMatcher::Framework("CoreImage"), false)?;
    let mut asm = Assembler::new(patcher);

    // Force return false.
    let mut gl_is_usable = image.resolve_sym(&["_CIGLIsUsable"])?;
    asm.write_movz_incr(
        image.path,
        image.header,
        &mut gl_is_usable,
        Reg::R0,
        false,
        0,
        MovzShift::Shift0,
    )?;
    asm.write_ret(image.path, image.header, gl_is_usable)?;

    // Allow widgets to use software rendering.
    match image.resolve_sym(&["___isWidget_block_invoke"]) {
        Ok(addr) => asm.write_ret(image.path, image.header, addr)?,
        Err(err) if err.is_not_found() => warn!("{err} (normal for iOS <=16)"),
        Err(err) => return Err(err),
    }

    // Allow core UI to use software rendering: drop both allow-list
    // branches inside the block.
    let result = (|| -> Result<()> {
        let block = image.resolve_sym(&["____ZL13isSWAllowListv_block_invoke"])?;
        let mut stream = image.open()?;
        let mut addr = arm64::find_cbz(&mut stream, image.header, block, true, false, 8)?;
        asm.write_nop_incr(image.path, image.header, &mut addr)?;
        let second = arm64::find_cbz(&mut stream, image.header, addr, false, false, 8)?;
        asm.write_nop(image.path, image.header, second)?;
        Ok(())
    })();
    match result {
        Ok(()) => {}
        Err(err) if err.is_not_found() => warn!("{err} (normal for iOS <=16)"),
        Err(err) => return Err(err),
    }

    Ok(())
}

/// QuartzCore: work around missing null checks on the asynchronous
/// dispatcher's renderer, and neutralise CIF10 (framebuffer
/// compression) support.
fn quartz_core(analyser: &CacheAnalyser, patcher: &mut Patcher) -> Result<()> {
    let image = analyser.find_image(&ImageMatcher::Framework("QuartzCore"), false)?;
    let mut asm = Assembler::new(patcher);

    let renderer = image.resolve_sym(&["__ZN2CA3OGL22AsynchronousDispatcher8rendererEv"])?;
    let mut stream = image.open()?;
    fix_async_dispatcher(
        &image,
        &mut asm,
        &mut stream,
        renderer,
        "__ZN2CA3OGL22AsynchronousDispatcher10stop_timerEv",
    )?;
    fix_async_dispatcher(
        &image,
        &mut asm,
        &mut stream,
        renderer,
        "__ZN2CA3OGLL17release_iosurfaceEP11__IOSurface",
    )?;

    asm.write_ret(
        image.path,
        image.header,
        image.resolve_sym(&["___CADeviceSupportsCIF10_block_invoke"])?,
    )?;

    Ok(())
}

/// Old builds call the renderer inside `sym` without a null check. If no
/// CBZ follows the call, drop the call and the authenticated dispatch
/// after it; fixed builds are left alone.
fn fix_async_dispatcher<R: std::io::Read + std::io::Seek>(
    image: &Image<'_>,
    asm: &mut Assembler<'_>,
    stream: &mut R,
    renderer: u64,
    sym: &str,
) -> Result<()> {
    let start = image.resolve_sym(&[sym])?;
    let mut renderer_call = arm64::find_bl_incr(
        stream,
        image.header,
        start,
        Some(renderer),
        false,
        arm64::DEFAULT_INST_LIMIT,
    )?;

    match arm64::find_cbz(stream, image.header, renderer_call, true, false, 1) {
        Ok(_) => {
            info!("detected fixed AsynchronousDispatcher logic, skipping {sym}");
        }
        Err(err) if err.is_not_found() => {
            asm.write_nop_incr(image.path, image.header, &mut renderer_call)?;
            asm.write_nop_incr(image.path, image.header, &mut renderer_call)?;
            asm.write_nop_incr(image.path, image.header, &mut renderer_call)?;
            let blra = arm64::find_blra(
                stream,
                image.header,
                renderer_call,
                true,
                false,
                false,
                4,
            )?;
            asm.write_nop(image.path, image.header, blra)?;
        }
        Err(err) => return Err(err),
    }

    Ok(())
}

/// SpringBoardFoundation: render wallpapers out of process, which works
/// without a GPU.
fn springboard_foundation(analyser: &CacheAnalyser, patcher: &mut Patcher) -> Result<()> {
    let image = analyser.find_image(&ImageMatcher::PrivateFramework("SpringBoardFoundation"), false)?;
    let mut asm = Assembler::new(patcher);

    // Force return true.
    let mut use_xpc_rendering =
        image.resolve_sym(&["+[SBFCARenderer shouldUseXPCServiceForRendering]"])?;
    asm.write_movz_incr(
        image.path,
        image.header,
        &mut use_xpc_rendering,
        Reg::R0,
        false,
        1,
        MovzShift::Shift0,
    )?;
    asm.write_ret(image.path, image.header, use_xpc_rendering)?;

    Ok(())
}

/// CMCapture: neutralise shader precompilation, which requires a GPU.
fn cm_capture(analyser: &CacheAnalyser, patcher: &mut Patcher) -> Result<()> {
    let image = analyser.find_image(&ImageMatcher::PrivateFramework("CMCapture"), false)?;
    let mut asm = Assembler::new(patcher);

    let result = (|| -> Result<()> {
        asm.write_ret(
            image.path,
            image.header,
            image.resolve_sym(&["_FigPreloadShaders", "_FigCapturePreloadShaders"])?,
        )?;
        asm.write_ret(
            image.path,
            image.header,
            image.resolve_sym(&[
                "_FigWaitForPreloadShadersCompletion",
                "_FigCaptureWaitForPreloadShadersCompletion",
            ])?,
        )?;
        Ok(())
    })();
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => {
            warn!("{err} (normal for iOS <=14)");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// libTelephonyUtilDynamic: drop the hardcoded expectations for a
/// baseband radio.
fn telephony_util(analyser: &CacheAnalyser, patcher: &mut Patcher) -> Result<()> {
    let image =
        analyser.find_image(&ImageMatcher::Exact("/usr/lib/libTelephonyUtilDynamic.dylib"), false)?;

    // Zero the cached radio identification globals.
    for sym in [
        "_sTelephonyProduct",
        "_sTelephonyRadio",
        "_sTelephonyRadioVendor",
    ] {
        let vm_addr = image.resolve_sym(&[sym])?;
        let (file_off, entry) = analyser.find_entry_from_vm_addr(vm_addr)?;
        patcher.write(&entry.path, file_off, &[0, 0, 0, 0]);
    }

    let mut asm = Assembler::new(patcher);
    asm.write_ret(
        image.path,
        image.header,
        image.resolve_sym(&["__TelephonyRadiosDetermineRadio"])?,
    )?;

    Ok(())
}

/// NeutrinoCore: rewrite the renderer factory to allocate
/// `NUSoftwareRenderer` unconditionally.
fn neutrino_core(analyser: &CacheAnalyser, patcher: &mut Patcher) -> Result<()> {
    let objc_image = analyser.find_image(&ImageMatcher::Exact("/usr/lib/libobjc.A.dylib"), false)?;
    let image = analyser.find_image(&ImageMatcher::PrivateFramework("NeutrinoCore"), true)?;

    let objc_alloc_init = objc_image.resolve_sym(&["_objc_alloc_init"])?;
    let nu_sw_renderer = image.resolve_objc_class("NUSoftwareRenderer")?;
    let mut address = image.resolve_sym(&[
        "-[NUDevice_iOS _newRendererWithCIContextOptions:error:]",
        "-[NUDevice_iOS _newRendererWithOptions:error:]",
    ])?;

    let mut asm = Assembler::new(patcher);
    asm.write_adrp_add_incr(image.path, image.header, &mut address, nu_sw_renderer, Reg::R0)?;
    asm.write_adrp_add_incr(image.path, image.header, &mut address, objc_alloc_init, Reg::R1)?;
    asm.write_blr(image.path, image.header, address, Reg::R1)?;

    Ok(())
}

/// libsystem_trace: claim a development build so os_log stops redacting
/// dynamic values.
fn libsystem_trace(analyser: &CacheAnalyser, patcher: &mut Patcher) -> Result<()> {
    let image =
        analyser.find_image(&ImageMatcher::Exact("/usr/lib/system/libsystem_trace.dylib"), false)?;
    let mut asm = Assembler::new(patcher);

    // Force return true.
    let mut is_development_build = image.resolve_sym(&["__os_trace_is_development_build"])?;
    asm.write_movz_incr(
        image.path,
        image.header,
        &mut is_development_build,
        Reg::R0,
        false,
        1,
        MovzShift::Shift0,
    )?;
    asm.write_ret(image.path, image.header, is_development_build)?;

    Ok(())
}
