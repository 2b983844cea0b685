use bar_tracker_core::{
    validate_core_config, BarTrackError, BarTracker, BeatSynchronizer, CoreConfig,
};
use ndarray::ArrayView2;
use serde::Serialize;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_float, c_uint};
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u32)]
enum FfiErrorCode {
    #[default]
    Ok = 0,
    NullPointer = 1,
    Utf8 = 2,
    ConfigParse = 3,
    ConfigValidation = 4,
    ShapeMismatch = 5,
    EmptyInput = 6,
    Unreachable = 7,
    InvalidInput = 8,
    Io = 9,
    Json = 10,
    Internal = 11,
}

impl FfiErrorCode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NullPointer => "NULL_POINTER",
            Self::Utf8 => "UTF8_ERROR",
            Self::ConfigParse => "CONFIG_PARSE_ERROR",
            Self::ConfigValidation => "CONFIG_VALIDATION_ERROR",
            Self::ShapeMismatch => "SHAPE_MISMATCH",
            Self::EmptyInput => "EMPTY_INPUT",
            Self::Unreachable => "UNREACHABLE",
            Self::InvalidInput => "INVALID_INPUT",
            Self::Io => "IO_ERROR",
            Self::Json => "JSON_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct LastErrorState {
    code: FfiErrorCode,
    message: String,
    path: Option<String>,
    context: Option<String>,
}

#[derive(Debug)]
struct FfiFailure {
    code: FfiErrorCode,
    message: String,
    path: Option<String>,
    context: Option<String>,
}

impl FfiFailure {
    fn new(
        code: FfiErrorCode,
        message: impl Into<String>,
        path: Option<impl Into<String>>,
        context: Option<impl Into<String>>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            path: path.map(|p| p.into()),
            context: context.map(|c| c.into()),
        }
    }

    fn null_pointer(name: &str) -> Self {
        Self::new(
            FfiErrorCode::NullPointer,
            format!("{} is null", name),
            Some(name),
            None::<String>,
        )
    }
}

impl From<BarTrackError> for FfiFailure {
    fn from(err: BarTrackError) -> Self {
        let message = err.to_string();
        match err {
            BarTrackError::ShapeMismatch { what, .. } => Self::new(
                FfiErrorCode::ShapeMismatch,
                message,
                None::<String>,
                Some(what),
            ),
            BarTrackError::EmptyInput(_) => {
                Self::new(FfiErrorCode::EmptyInput, message, None::<String>, None::<String>)
            }
            BarTrackError::Unreachable { .. } => {
                Self::new(FfiErrorCode::Unreachable, message, None::<String>, None::<String>)
            }
            BarTrackError::InvalidConfiguration(issue) => Self::new(
                FfiErrorCode::ConfigValidation,
                message,
                Some(issue.path),
                None::<String>,
            ),
            BarTrackError::InvalidInput(_) => {
                Self::new(FfiErrorCode::InvalidInput, message, None::<String>, None::<String>)
            }
            BarTrackError::Io(_) => {
                Self::new(FfiErrorCode::Io, message, None::<String>, None::<String>)
            }
        }
    }
}

#[derive(Serialize)]
struct LastErrorPayload<'a> {
    code: u32,
    code_name: &'static str,
    message: &'a str,
    path: Option<&'a str>,
    context: Option<&'a str>,
}

#[derive(Serialize)]
struct SyncPayload {
    num_beats: usize,
    subdivisions: usize,
    feature_dim: usize,
    /// Row stride of `data`: `feature_dim * subdivisions`.
    row_width: usize,
    /// Row-major, one row per beat with subdivisions side by side.
    data: Vec<f32>,
}

static LAST_ERROR: OnceLock<Mutex<LastErrorState>> = OnceLock::new();

fn set_last_error(code: FfiErrorCode, message: impl Into<String>) {
    set_last_error_from_failure(FfiFailure::new(
        code,
        message,
        None::<String>,
        None::<String>,
    ));
}

fn set_last_error_from_failure(failure: FfiFailure) {
    let lock = LAST_ERROR.get_or_init(|| Mutex::new(LastErrorState::default()));
    if let Ok(mut guard) = lock.lock() {
        guard.code = failure.code;
        guard.message = failure.message;
        guard.path = failure.path;
        guard.context = failure.context;
    }
}

fn clear_last_error() {
    set_last_error(FfiErrorCode::Ok, "");
}

fn get_last_error_snapshot() -> LastErrorState {
    let lock = LAST_ERROR.get_or_init(|| Mutex::new(LastErrorState::default()));
    match lock.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => LastErrorState {
            code: FfiErrorCode::Internal,
            message: "failed to lock error mutex".to_string(),
            path: None,
            context: None,
        },
    }
}

fn last_error_json_string() -> String {
    let state = get_last_error_snapshot();
    let payload = LastErrorPayload {
        code: state.code as u32,
        code_name: state.code.as_str(),
        message: state.message.as_str(),
        path: state.path.as_deref(),
        context: state.context.as_deref(),
    };
    serde_json::to_string(&payload).unwrap_or_else(|_| {
        "{\"code\":11,\"code_name\":\"INTERNAL_ERROR\",\"message\":\"failed to serialize last error\",\"path\":null,\"context\":null}".to_string()
    })
}

fn into_c_string_ptr(s: String) -> *mut c_char {
    CString::new(s).unwrap_or_default().into_raw()
}

/// Publish a result: JSON on success, NULL plus last-error state on failure.
fn finish<T: Serialize>(result: Result<T, FfiFailure>) -> *mut c_char {
    let value = match result {
        Ok(value) => value,
        Err(failure) => {
            set_last_error_from_failure(failure);
            return std::ptr::null_mut();
        }
    };
    match serde_json::to_string(&value) {
        Ok(json) => {
            clear_last_error();
            into_c_string_ptr(json)
        }
        Err(err) => {
            set_last_error(FfiErrorCode::Json, err.to_string());
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub extern "C" fn bar_tracker_last_error_message() -> *mut c_char {
    let state = get_last_error_snapshot();
    into_c_string_ptr(state.message)
}

#[no_mangle]
pub extern "C" fn bar_tracker_last_error_code() -> c_uint {
    let state = get_last_error_snapshot();
    state.code as c_uint
}

#[no_mangle]
pub extern "C" fn bar_tracker_last_error_json() -> *mut c_char {
    into_c_string_ptr(last_error_json_string())
}

#[no_mangle]
pub extern "C" fn bar_tracker_default_config_json() -> *mut c_char {
    match serde_json::to_string_pretty(&CoreConfig::default()) {
        Ok(json) => into_c_string_ptr(json),
        Err(err) => {
            set_last_error(
                FfiErrorCode::Json,
                format!("failed to serialize default config: {err}"),
            );
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
/// # Safety
/// - `config_json` must be null or a valid, null-terminated UTF-8 string.
///
/// Returns NULL on success. On validation error, returns a newly allocated JSON
/// payload and also updates bar_tracker_last_error_*.
pub unsafe extern "C" fn bar_tracker_validate_config_json(
    config_json: *const c_char,
) -> *mut c_char {
    match parse_config(config_json) {
        Ok(_) => {
            clear_last_error();
            std::ptr::null_mut()
        }
        Err(failure) => {
            set_last_error_from_failure(failure);
            into_c_string_ptr(last_error_json_string())
        }
    }
}

#[no_mangle]
/// # Safety
/// The pointer must be either null or previously returned by this library and
/// not already freed.
pub unsafe extern "C" fn bar_tracker_free_string(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    drop(CString::from_raw(s));
}

#[no_mangle]
/// Decode bar positions; returns the decoded table as JSON.
///
/// # Safety
/// - `observations_ptr` must be valid for reads of `num_beats * observation_dim`
///   floats laid out row-major (one row per beat).
/// - `beat_times_ptr` must be valid for reads of `num_beats` floats.
/// - `config_json` must be null or a valid, null-terminated UTF-8 string.
pub unsafe extern "C" fn bar_tracker_decode_json(
    observations_ptr: *const c_float,
    num_beats: usize,
    observation_dim: usize,
    beat_times_ptr: *const c_float,
    config_json: *const c_char,
) -> *mut c_char {
    finish(decode_inner(
        observations_ptr,
        num_beats,
        observation_dim,
        beat_times_ptr,
        config_json,
    ))
}

unsafe fn decode_inner(
    observations_ptr: *const c_float,
    num_beats: usize,
    observation_dim: usize,
    beat_times_ptr: *const c_float,
    config_json: *const c_char,
) -> Result<bar_tracker_core::DecodedBars, FfiFailure> {
    let config = parse_config(config_json)?;
    let observations = matrix_view(
        "observations_ptr",
        observations_ptr,
        num_beats,
        observation_dim,
    )?;
    let beat_times = float_slice("beat_times_ptr", beat_times_ptr, num_beats)?;
    let tracker = BarTracker::new(config.dbn)?;
    Ok(tracker.decode(observations, beat_times)?)
}

#[no_mangle]
/// Beat-synchronize frame features; returns
/// `{num_beats, subdivisions, feature_dim, row_width, data}` JSON.
///
/// # Safety
/// - `features_ptr` must be valid for reads of `num_frames * feature_dim` floats,
///   row-major (one row per frame).
/// - `frame_times_ptr` must be valid for reads of `num_frames` floats.
/// - `beat_times_ptr` must be valid for reads of `num_beats` floats.
/// - `config_json` must be null or a valid, null-terminated UTF-8 string.
pub unsafe extern "C" fn bar_tracker_synchronize_json(
    features_ptr: *const c_float,
    num_frames: usize,
    feature_dim: usize,
    frame_times_ptr: *const c_float,
    beat_times_ptr: *const c_float,
    num_beats: usize,
    config_json: *const c_char,
) -> *mut c_char {
    finish(synchronize_inner(
        features_ptr,
        num_frames,
        feature_dim,
        frame_times_ptr,
        beat_times_ptr,
        num_beats,
        config_json,
    ))
}

#[allow(clippy::too_many_arguments)]
unsafe fn synchronize_inner(
    features_ptr: *const c_float,
    num_frames: usize,
    feature_dim: usize,
    frame_times_ptr: *const c_float,
    beat_times_ptr: *const c_float,
    num_beats: usize,
    config_json: *const c_char,
) -> Result<SyncPayload, FfiFailure> {
    let config = parse_config(config_json)?;
    let features = matrix_view("features_ptr", features_ptr, num_frames, feature_dim)?;
    let frame_times = float_slice("frame_times_ptr", frame_times_ptr, num_frames)?;
    let beat_times = float_slice("beat_times_ptr", beat_times_ptr, num_beats)?;
    let synchronizer = BeatSynchronizer::new(&config.sync)?;
    let synced = synchronizer.synchronize(features, frame_times, beat_times)?;
    let per_beat = synced.per_beat()?;
    Ok(SyncPayload {
        num_beats: per_beat.nrows(),
        subdivisions: synced.subdivisions,
        feature_dim,
        row_width: per_beat.ncols(),
        data: per_beat.iter().copied().collect(),
    })
}

/// Zero-length inputs may come with a null pointer.
unsafe fn float_slice<'a>(
    name: &str,
    ptr: *const c_float,
    len: usize,
) -> Result<&'a [f32], FfiFailure> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(FfiFailure::null_pointer(name));
    }
    Ok(std::slice::from_raw_parts(ptr, len))
}

unsafe fn matrix_view<'a>(
    name: &str,
    ptr: *const c_float,
    rows: usize,
    cols: usize,
) -> Result<ArrayView2<'a, f32>, FfiFailure> {
    let len = rows.checked_mul(cols).ok_or_else(|| {
        FfiFailure::new(
            FfiErrorCode::InvalidInput,
            format!("{} shape {}x{} overflows", name, rows, cols),
            Some(name),
            None::<String>,
        )
    })?;
    let data = float_slice(name, ptr, len)?;
    ArrayView2::from_shape((rows, cols), data).map_err(|err| {
        FfiFailure::new(
            FfiErrorCode::ShapeMismatch,
            err.to_string(),
            Some(name),
            None::<String>,
        )
    })
}

fn validate_config(config: CoreConfig) -> Result<CoreConfig, FfiFailure> {
    validate_core_config(&config).map_err(|issue| {
        FfiFailure::new(
            FfiErrorCode::ConfigValidation,
            format!("invalid config: {}", issue.message),
            Some(issue.path),
            None::<String>,
        )
    })?;
    Ok(config)
}

unsafe fn parse_config(config_json: *const c_char) -> Result<CoreConfig, FfiFailure> {
    if config_json.is_null() {
        return validate_config(CoreConfig::default());
    }

    let cstr = CStr::from_ptr(config_json);
    let json = cstr.to_str().map_err(|err| {
        FfiFailure::new(
            FfiErrorCode::Utf8,
            format!("config_json is not valid UTF-8: {err}"),
            Some("config_json"),
            None::<String>,
        )
    })?;
    if json.trim().is_empty() {
        return validate_config(CoreConfig::default());
    }

    let config = serde_json::from_str::<CoreConfig>(json).map_err(|err| {
        let context = if err.line() > 0 {
            Some(format!("line {}, column {}", err.line(), err.column()))
        } else {
            None
        };
        FfiFailure::new(
            FfiErrorCode::ConfigParse,
            format!("failed to parse config_json: {err}"),
            Some("config_json"),
            context,
        )
    })?;

    validate_config(config)
}
