//! C FFI surface for tunemix.
//!
//! Pattern: opaque EngineHandle / MusicHandle + C strings + JSON for
//! config, commands and status. Integer-returning control calls use
//! 0 for success and -1 for failure; pointer-returning calls use NULL.
//! The reason for a failure is available from `tunemix_last_error`.
//!
//! A host mixer opens an engine with its negotiated hardware format and
//! calls `tunemix_mix` from its audio callback for every buffer.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use tunemix_core::{
    Engine, HardwareFormat, MixHandle, MixerConfig, Music, MusicError, PlaybackCommand, SampleFormat,
};

// ---------------------------------------------------------------------------
// Error handling (thread-local last error)
// ---------------------------------------------------------------------------

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn set_error(msg: String) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(msg));
}

fn clear_error() {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = None);
}

/// Returns the last error message (caller frees with `tunemix_string_free`).
#[no_mangle]
pub extern "C" fn tunemix_last_error() -> *mut c_char {
    LAST_ERROR.with(|cell| {
        cell.borrow_mut()
            .take()
            .and_then(|s| CString::new(s).ok())
            .map(|s| s.into_raw())
            .unwrap_or(ptr::null_mut())
    })
}

/// Frees a string returned from tunemix FFI.
///
/// # Safety
/// Must be a pointer returned from this FFI and not already freed.
#[no_mangle]
pub unsafe extern "C" fn tunemix_string_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        let _ = CString::from_raw(ptr);
    }
}

// ---------------------------------------------------------------------------
// Opaque handles
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct EngineHandle {
    _private: [u8; 0],
}

#[repr(C)]
pub struct MusicHandle {
    _private: [u8; 0],
}

struct EngineHandleInner {
    engine: Engine,
    mixer: MixHandle,
}

// ---------------------------------------------------------------------------
// Hardware format codes
// ---------------------------------------------------------------------------

pub const TUNEMIX_AUDIO_U8: u16 = 0x0008;
pub const TUNEMIX_AUDIO_S8: u16 = 0x8008;
pub const TUNEMIX_AUDIO_U16LSB: u16 = 0x0010;
pub const TUNEMIX_AUDIO_S16LSB: u16 = 0x8010;
pub const TUNEMIX_AUDIO_U16MSB: u16 = 0x1010;
pub const TUNEMIX_AUDIO_S16MSB: u16 = 0x9010;

fn sample_format(code: u16) -> Option<SampleFormat> {
    match code {
        TUNEMIX_AUDIO_U8 => Some(SampleFormat::U8),
        TUNEMIX_AUDIO_S8 => Some(SampleFormat::S8),
        TUNEMIX_AUDIO_U16LSB => Some(SampleFormat::U16Lsb),
        TUNEMIX_AUDIO_S16LSB => Some(SampleFormat::S16Lsb),
        TUNEMIX_AUDIO_U16MSB => Some(SampleFormat::U16Msb),
        TUNEMIX_AUDIO_S16MSB => Some(SampleFormat::S16Msb),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Opens an engine for the hardware format the host mixer negotiated.
///
/// `config_json` may be NULL for defaults. `TUNEMIX_MUSIC_CMD` in the
/// environment overrides the configured music command. Returns NULL on
/// error.
#[no_mangle]
pub extern "C" fn tunemix_open(
    freq: u32,
    format: u16,
    channels: u16,
    samples: u16,
    config_json: *const c_char,
) -> *mut EngineHandle {
    clear_error();
    let Some(format) = sample_format(format) else {
        return err_null(format!("unknown audio format code 0x{:04X}", format));
    };

    let config = if config_json.is_null() {
        MixerConfig::default()
    } else {
        let text = match read_cstr(config_json) {
            Ok(t) => t,
            Err(e) => return err_null(e),
        };
        match MixerConfig::from_json(&text) {
            Ok(c) => c,
            Err(e) => return err_null(e.to_string()),
        }
    };

    let hardware = HardwareFormat::new(freq, format, channels, samples);
    match Engine::open(hardware, config.apply_env()) {
        Ok(engine) => {
            let mixer = engine.mix_handle();
            Box::into_raw(Box::new(EngineHandleInner { engine, mixer })) as *mut EngineHandle
        }
        Err(e) => err_null(e.to_string()),
    }
}

/// Halts music, shuts the engine down and releases it.
#[no_mangle]
pub extern "C" fn tunemix_close(handle: *mut EngineHandle) {
    if !handle.is_null() {
        unsafe {
            let inner = Box::from_raw(handle as *mut EngineHandleInner);
            inner.engine.shutdown();
        }
    }
}

/// Mixing callback: renders the active music into `stream` (`len` bytes).
/// Leaves the buffer untouched when nothing can be rendered.
///
/// # Safety
/// `stream` must point to `len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn tunemix_mix(handle: *mut EngineHandle, stream: *mut u8, len: i32) {
    if handle.is_null() || stream.is_null() || len <= 0 {
        return;
    }
    let inner = &*(handle as *mut EngineHandleInner);
    let buf = std::slice::from_raw_parts_mut(stream, len as usize);
    inner.mixer.mix(buf);
}

// ---------------------------------------------------------------------------
// Music handles
// ---------------------------------------------------------------------------

/// Loads a music file. Returns NULL on error.
#[no_mangle]
pub extern "C" fn tunemix_load_music(handle: *mut EngineHandle, path: *const c_char) -> *mut MusicHandle {
    clear_error();
    let engine = match engine_ref(handle) {
        Ok(e) => e,
        Err(e) => return err_null(e),
    };
    let path = match read_cstr(path) {
        Ok(p) => p,
        Err(e) => return err_null(e),
    };
    match engine.load(&path) {
        Ok(music) => Box::into_raw(Box::new(music)) as *mut MusicHandle,
        Err(e) => err_null(e.to_string()),
    }
}

/// Frees a music handle, halting it first if it is playing. NULL is a no-op.
#[no_mangle]
pub extern "C" fn tunemix_free_music(handle: *mut EngineHandle, music: *mut MusicHandle) {
    if music.is_null() {
        return;
    }
    let music = unsafe { Box::from_raw(music as *mut Music) };
    match engine_ref(handle) {
        Ok(engine) => engine.free_music(*music),
        // No engine to halt through; dropping still releases the backend
        Err(_) => drop(music),
    }
}

// ---------------------------------------------------------------------------
// Playback control
// ---------------------------------------------------------------------------

/// Plays `music`; `loops` = -1 repeats forever (MPEG only). 0 on success.
#[no_mangle]
pub extern "C" fn tunemix_play_music(handle: *mut EngineHandle, music: *mut MusicHandle, loops: i32) -> i32 {
    clear_error();
    let engine = match engine_ref(handle) {
        Ok(e) => e,
        Err(e) => return err_code(e),
    };
    let Some(music) = music_ref(music) else {
        return err_code(MusicError::NullHandle.to_string());
    };
    match engine.play(music, loops) {
        Ok(()) => 0,
        Err(e) => err_code(e.to_string()),
    }
}

#[no_mangle]
pub extern "C" fn tunemix_halt_music(handle: *mut EngineHandle) -> i32 {
    clear_error();
    match engine_ref(handle).map(|engine| engine.halt()) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => err_code(e.to_string()),
        Err(e) => err_code(e),
    }
}

#[no_mangle]
pub extern "C" fn tunemix_pause_music(handle: *mut EngineHandle) {
    if let Ok(engine) = engine_ref(handle) {
        engine.pause();
    }
}

#[no_mangle]
pub extern "C" fn tunemix_resume_music(handle: *mut EngineHandle) {
    if let Ok(engine) = engine_ref(handle) {
        engine.resume();
    }
}

#[no_mangle]
pub extern "C" fn tunemix_rewind_music(handle: *mut EngineHandle) {
    if let Ok(engine) = engine_ref(handle) {
        engine.rewind();
    }
}

/// Sets the music volume (0..=128) and returns the previous one. A negative
/// `volume` only queries. Returns -1 for a NULL engine.
#[no_mangle]
pub extern "C" fn tunemix_volume_music(handle: *mut EngineHandle, volume: i32) -> i32 {
    clear_error();
    match engine_ref(handle) {
        Ok(engine) => engine.set_volume(volume),
        Err(e) => err_code(e),
    }
}

/// 1 while music is playing (paused counts), 0 otherwise.
#[no_mangle]
pub extern "C" fn tunemix_playing_music(handle: *mut EngineHandle) -> i32 {
    match engine_ref(handle) {
        Ok(engine) => engine.is_playing() as i32,
        Err(_) => 0,
    }
}

/// 1 while music is paused, 0 otherwise.
#[no_mangle]
pub extern "C" fn tunemix_paused_music(handle: *mut EngineHandle) -> i32 {
    match engine_ref(handle) {
        Ok(engine) => engine.is_paused() as i32,
        Err(_) => 0,
    }
}

/// Routes later loads through an external player command; NULL clears it.
/// Halts the current music. 0 on success.
#[no_mangle]
pub extern "C" fn tunemix_set_music_cmd(handle: *mut EngineHandle, command: *const c_char) -> i32 {
    clear_error();
    let engine = match engine_ref(handle) {
        Ok(e) => e,
        Err(e) => return err_code(e),
    };
    let command = if command.is_null() {
        None
    } else {
        match read_cstr(command) {
            Ok(c) => Some(c),
            Err(e) => return err_code(e),
        }
    };
    match engine.set_music_cmd(command.as_deref()) {
        Ok(()) => 0,
        Err(e) => err_code(e.to_string()),
    }
}

/// Sends a JSON playback command, e.g. `{"action":"volume","volume":64}`.
/// 0 on success.
#[no_mangle]
pub extern "C" fn tunemix_command(handle: *mut EngineHandle, json: *const c_char) -> i32 {
    clear_error();
    let engine = match engine_ref(handle) {
        Ok(e) => e,
        Err(e) => return err_code(e),
    };
    let json_str = match read_cstr(json) {
        Ok(s) => s,
        Err(e) => return err_code(e),
    };
    let cmd: PlaybackCommand = match serde_json::from_str(&json_str) {
        Ok(c) => c,
        Err(e) => return err_code(format!("invalid command: {}", e)),
    };
    match engine.command(cmd) {
        Ok(()) => 0,
        Err(e) => err_code(e.to_string()),
    }
}

/// Playback status as JSON (caller frees), or NULL on error.
#[no_mangle]
pub extern "C" fn tunemix_status(handle: *mut EngineHandle) -> *mut c_char {
    clear_error();
    match engine_ref(handle) {
        Ok(engine) => json_to_cstr(&engine.status()),
        Err(e) => err_null(e),
    }
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Returns the FFI API version.
#[no_mangle]
pub extern "C" fn tunemix_version() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn engine_ref<'a>(handle: *mut EngineHandle) -> Result<&'a Engine, String> {
    if handle.is_null() {
        return Err("null engine handle".into());
    }
    let inner = unsafe { &*(handle as *mut EngineHandleInner) };
    Ok(&inner.engine)
}

fn music_ref<'a>(music: *mut MusicHandle) -> Option<&'a Music> {
    if music.is_null() {
        return None;
    }
    Some(unsafe { &*(music as *mut Music) })
}

fn read_cstr(ptr: *const c_char) -> Result<String, String> {
    if ptr.is_null() {
        return Err("null string pointer".into());
    }
    unsafe {
        CStr::from_ptr(ptr)
            .to_str()
            .map(String::from)
            .map_err(|_| "invalid utf-8".into())
    }
}

fn json_to_cstr<T: serde::Serialize>(value: &T) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(json) => to_cstr(json),
        Err(e) => err_null(e.to_string()),
    }
}

fn to_cstr(s: String) -> *mut c_char {
    CString::new(s)
        .map(|c| c.into_raw())
        .unwrap_or(ptr::null_mut())
}

fn err_null<T>(msg: String) -> *mut T {
    log::debug!("tunemix: ffi error: {}", msg);
    set_error(msg);
    ptr::null_mut()
}

fn err_code(msg: String) -> i32 {
    log::debug!("tunemix: ffi error: {}", msg);
    set_error(msg);
    -1
}

// ---------------------------------------------------------------------------
// FFI Integration Tests
// ---------------------------------------------------------------------------
