//! The foreign call bridge: binds call sites to internal operations or to
//! symbols in native libraries, and invokes them.

use libloading::Library;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::collections::HashMap;
use std::ffi::{c_void, CString, OsString};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, trace, warn};

use crate::error::{InteropError, ResolutionError};
use crate::internal::{self, CallContext, InternalOp};
use crate::types::{Signature, Str, ValueKind};
use crate::values::{ExceptionObject, Value};

/// Native calling conventions, numbered like the PInvoke attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum CallingConvention {
    Winapi = 0x0100,
    Cdecl = 0x0200,
    StdCall = 0x0300,
    ThisCall = 0x0400,
    FastCall = 0x0500,
}

impl CallingConvention {
    pub const MASK: u16 = 0x0700;

    /// Extract the convention from a full set of PInvoke attribute flags.
    pub fn from_pinvoke_flags(flags: u16) -> Option<Self> {
        Self::try_from(flags & Self::MASK).ok()
    }

    /// Whether calls in this convention can go through a C function pointer
    /// on the current target.
    pub fn is_c_abi(self) -> bool {
        match self {
            CallingConvention::Cdecl | CallingConvention::Winapi => true,
            // Only 32-bit x86 gives these their own register and cleanup rules.
            _ => !cfg!(target_arch = "x86"),
        }
    }
}

/// Identity of a call target that is not an interpretable method body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ForeignDescriptor {
    Internal(Str),
    External {
        library: Str,
        symbol: Str,
        convention: CallingConvention,
        signature: Signature,
    },
}

impl ForeignDescriptor {
    pub fn internal(id: &str) -> Self {
        ForeignDescriptor::Internal(Str::from(id))
    }

    pub fn external(
        library: &str,
        symbol: &str,
        convention: CallingConvention,
        signature: Signature,
    ) -> Self {
        ForeignDescriptor::External {
            library: Str::from(library),
            symbol: Str::from(symbol),
            convention,
            signature,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, ForeignDescriptor::External { .. })
    }
}

impl fmt::Display for ForeignDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForeignDescriptor::Internal(id) => write!(f, "internal {}", &**id),
            ForeignDescriptor::External {
                library, symbol, ..
            } => write!(f, "{}!{}", &**library, &**symbol),
        }
    }
}

/// Result of invoking a foreign target.
#[derive(Debug)]
pub enum ForeignOutcome {
    Return(Option<Value>),
    /// The target raised a managed exception.
    Throw(ExceptionObject),
    /// The target requested that the whole call stack be abandoned.
    Abort(String),
}

#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    /// Directories searched for native libraries before the system loader.
    pub search_paths: Vec<PathBuf>,
}

impl BridgeConfig {
    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub resolutions: u64,
    pub cache_hits: u64,
    pub internal_invocations: u64,
    pub native_invocations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    resolutions: AtomicU64,
    cache_hits: AtomicU64,
    internal_invocations: AtomicU64,
    native_invocations: AtomicU64,
}

/// Address of a resolved native symbol.
#[derive(Debug, Clone, Copy)]
struct CodePtr(*const c_void);

// The address is immutable and only ever called through; the owning
// library is kept alive next to it.
unsafe impl Send for CodePtr {}
unsafe impl Sync for CodePtr {}

#[derive(Debug)]
struct NativeFunction {
    _library: Arc<Library>,
    address: CodePtr,
    convention: CallingConvention,
    signature: Signature,
}

#[derive(Debug)]
enum Callable {
    Internal(&'static InternalOp),
    External(NativeFunction),
}

/// A descriptor bound to something callable.
#[derive(Debug)]
pub struct ResolvedTarget {
    descriptor: ForeignDescriptor,
    callable: Callable,
}

impl ResolvedTarget {
    pub fn descriptor(&self) -> &ForeignDescriptor {
        &self.descriptor
    }

    pub fn signature(&self) -> Signature {
        match &self.callable {
            Callable::Internal(op) => op.signature(),
            Callable::External(f) => f.signature.clone(),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.callable, Callable::Internal(_))
    }
}

#[derive(Debug, Default)]
pub struct NativeLibraryManager {
    libraries: RwLock<HashMap<Str, Arc<Library>>>,
}

impl NativeLibraryManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn candidates(name: &str) -> [String; 5] {
        [
            format!("lib{}.so", name),
            format!("{}.so", name),
            format!("lib{}.dylib", name),
            format!("{}.dylib", name),
            format!("{}.dll", name),
        ]
    }

    /// Load `name` once; later callers share the same handle.
    pub fn load(&self, name: &str, search_paths: &[PathBuf]) -> Result<Arc<Library>, ResolutionError> {
        let key = Str::from(name);
        if let Some(lib) = self
            .libraries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(lib.clone());
        }

        let mut searched = Vec::new();
        for dir in search_paths {
            for candidate in Self::candidates(name) {
                let path = dir.join(candidate);
                searched.push(path.display().to_string());
                if !path.exists() {
                    continue;
                }
                match unsafe { Library::new(&path) } {
                    Ok(lib) => {
                        debug!(library = name, path = %path.display(), "loaded native library");
                        return Ok(self.insert(key, lib));
                    }
                    Err(e) => warn!(library = name, path = %path.display(), error = %e, "candidate failed to load"),
                }
            }
        }

        for bare in [OsString::from(name), libloading::library_filename(name)] {
            searched.push(bare.to_string_lossy().into_owned());
            if let Ok(lib) = unsafe { Library::new(&bare) } {
                debug!(library = name, "loaded native library from system path");
                return Ok(self.insert(key, lib));
            }
        }

        Err(ResolutionError::LibraryNotFound {
            library: name.to_string(),
            searched: searched.join(", "),
        })
    }

    fn insert(&self, key: Str, lib: Library) -> Arc<Library> {
        self.libraries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert_with(|| Arc::new(lib))
            .clone()
    }
}

/// Resolves and invokes foreign call targets. Shared by every interpreter
/// running against the same program.
#[derive(Debug, Default)]
pub struct ForeignBridge {
    config: BridgeConfig,
    libraries: NativeLibraryManager,
    cache: RwLock<HashMap<ForeignDescriptor, Arc<ResolvedTarget>>>,
    counters: Counters,
}

impl ForeignBridge {
    pub fn new(config: BridgeConfig) -> Self {
        ForeignBridge {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            resolutions: self.counters.resolutions.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            internal_invocations: self.counters.internal_invocations.load(Ordering::Relaxed),
            native_invocations: self.counters.native_invocations.load(Ordering::Relaxed),
        }
    }

    /// Bind `descriptor`, reusing the cached binding when there is one.
    ///
    /// Failures are not cached: a library that appears later can still be
    /// bound. Concurrent first resolutions converge on whichever binding
    /// was inserted first.
    pub fn resolve(&self, descriptor: &ForeignDescriptor) -> Result<Arc<ResolvedTarget>, ResolutionError> {
        if let Some(target) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(descriptor)
        {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            trace!(%descriptor, cached = true, "resolved foreign target");
            return Ok(target.clone());
        }

        let callable = match descriptor {
            ForeignDescriptor::Internal(id) => Callable::Internal(
                internal::find(id)
                    .ok_or_else(|| ResolutionError::UnknownInternalOperation(id.to_string()))?,
            ),
            ForeignDescriptor::External {
                library,
                symbol,
                convention,
                signature,
            } => {
                let lib = self.libraries.load(library, &self.config.search_paths)?;
                let address = unsafe { lib.get::<*const c_void>(symbol.as_bytes()) }
                    .map(|s| *s)
                    .map_err(|_| ResolutionError::SymbolNotFound {
                        library: library.to_string(),
                        symbol: symbol.to_string(),
                    })?;
                Callable::External(NativeFunction {
                    _library: lib,
                    address: CodePtr(address),
                    convention: *convention,
                    signature: signature.clone(),
                })
            }
        };

        let target = self
            .cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(descriptor.clone())
            .or_insert_with(|| {
                self.counters.resolutions.fetch_add(1, Ordering::Relaxed);
                Arc::new(ResolvedTarget {
                    descriptor: descriptor.clone(),
                    callable,
                })
            })
            .clone();
        debug!(%descriptor, cached = false, "resolved foreign target");
        Ok(target)
    }

    /// Call a resolved target after checking `args` against its signature.
    pub fn invoke(
        &self,
        target: &ResolvedTarget,
        ctx: &mut CallContext<'_>,
        args: &[Value],
    ) -> Result<ForeignOutcome, InteropError> {
        let name = target.descriptor.to_string();
        check_args(&name, &target.signature(), args)?;
        trace!(target = %name, args = args.len(), "invoking foreign target");

        match &target.callable {
            Callable::Internal(op) => {
                self.counters.internal_invocations.fetch_add(1, Ordering::Relaxed);
                (op.func)(ctx, args)
            }
            Callable::External(function) => {
                let ret = function.call(&name, args, &self.counters.native_invocations)?;
                Ok(ForeignOutcome::Return(ret))
            }
        }
    }
}

fn check_args(target: &str, signature: &Signature, args: &[Value]) -> Result<(), InteropError> {
    if args.len() != signature.arity() {
        return Err(InteropError::ArityMismatch {
            target: target.to_string(),
            expected: signature.arity(),
            actual: args.len(),
        });
    }
    for (index, (kind, value)) in signature.params.iter().zip(args).enumerate() {
        if !value.fits(*kind) {
            return Err(InteropError::TypeMismatch {
                target: target.to_string(),
                index,
                expected: *kind,
                actual: value.tag_name(),
            });
        }
    }
    Ok(())
}

const MAX_INT_ARGS: usize = 6;
const MAX_FLOAT_ARGS: usize = 3;

#[derive(Debug, Clone, Copy)]
enum ReturnClass {
    Void,
    Int,
    Float,
}

#[derive(Debug, Clone, Copy)]
enum RawReturn {
    Void,
    Int(i64),
    Float(f64),
}

impl NativeFunction {
    fn call(&self, name: &str, args: &[Value], invocations: &AtomicU64) -> Result<Option<Value>, InteropError> {
        let fail = |reason: String| InteropError::MarshalingError {
            target: name.to_string(),
            reason,
        };

        if !self.convention.is_c_abi() {
            return Err(fail(format!(
                "calling convention {:?} is not supported on this target",
                self.convention
            )));
        }

        let ret_class = match self.signature.ret {
            ValueKind::Void => ReturnClass::Void,
            ValueKind::I4 | ValueKind::I8 | ValueKind::Bool | ValueKind::NativeInt => ReturnClass::Int,
            ValueKind::R8 => ReturnClass::Float,
            other => return Err(fail(format!("{} return values cannot be marshaled", other))),
        };

        // Owns the string buffers until the call has returned.
        let mut strings: Vec<CString> = Vec::new();
        let mut ints: Vec<i64> = Vec::new();
        let mut floats: Vec<f64> = Vec::new();
        for (kind, value) in self.signature.params.iter().zip(args) {
            match (kind, value) {
                (ValueKind::I4 | ValueKind::Bool, Value::I32(v)) => ints.push(*v as i64),
                (ValueKind::I8, Value::I64(v)) => ints.push(*v),
                (ValueKind::NativeInt, Value::NativePtr(p)) => ints.push(*p as i64),
                (ValueKind::R8, Value::F64(v)) => floats.push(*v),
                (ValueKind::String, Value::Null) => ints.push(0),
                (ValueKind::String, v) => {
                    let s = v
                        .as_str()
                        .ok_or_else(|| fail(format!("expected a string, got {}", v.tag_name())))?;
                    let c = CString::new(s)
                        .map_err(|_| fail("string argument contains an interior NUL".to_string()))?;
                    ints.push(c.as_ptr() as i64);
                    strings.push(c);
                }
                (kind, _) => return Err(fail(format!("{} arguments cannot be marshaled", kind))),
            }
        }

        if !ints.is_empty() && !floats.is_empty() {
            return Err(fail(
                "mixed integer and floating-point arguments are not supported".to_string(),
            ));
        }
        if ints.len() > MAX_INT_ARGS || floats.len() > MAX_FLOAT_ARGS {
            return Err(fail(format!("{} arguments is too many", args.len())));
        }

        invocations.fetch_add(1, Ordering::Relaxed);
        let raw = unsafe {
            if floats.is_empty() {
                call_with_ints(self.address.0, &ints, ret_class)
            } else {
                call_with_floats(self.address.0, &floats, ret_class)
            }
        }
        .map_err(fail)?;
        drop(strings);

        Ok(match (self.signature.ret, raw) {
            (ValueKind::I4, RawReturn::Int(v)) => Some(Value::I32(v as i32)),
            (ValueKind::Bool, RawReturn::Int(v)) => Some(Value::from_bool(v as u8 != 0)),
            (ValueKind::I8, RawReturn::Int(v)) => Some(Value::I64(v)),
            (ValueKind::NativeInt, RawReturn::Int(v)) => Some(Value::NativePtr(v as usize)),
            (ValueKind::R8, RawReturn::Float(v)) => Some(Value::F64(v)),
            _ => None,
        })
    }
}

/// Call `$addr` as `extern "C" fn($arg, ...) -> $ret` with the given values.
macro_rules! native_call {
    (@ty $unused:expr, $t:ty) => { $t };
    ($addr:expr, $ret:ty, $arg:ty; $($value:expr),*) => {{
        let f: unsafe extern "C" fn($(native_call!(@ty $value, $arg)),*) -> $ret =
            std::mem::transmute::<*const c_void, _>($addr);
        f($($value),*)
    }};
}

macro_rules! by_arity {
    ($addr:expr, $ret:ty, $arg:ty, $args:ident; $($n:literal => [$($i:literal),*]),+ $(,)?) => {
        match $args.len() {
            $($n => native_call!($addr, $ret, $arg; $($args[$i]),*),)+
            n => return Err(format!("{} arguments of this class are not supported", n)),
        }
    };
}

unsafe fn call_with_ints(addr: *const c_void, args: &[i64], ret: ReturnClass) -> Result<RawReturn, String> {
    Ok(match ret {
        ReturnClass::Void => {
            by_arity!(addr, (), i64, args;
                0 => [], 1 => [0], 2 => [0, 1], 3 => [0, 1, 2],
                4 => [0, 1, 2, 3], 5 => [0, 1, 2, 3, 4], 6 => [0, 1, 2, 3, 4, 5]);
            RawReturn::Void
        }
        ReturnClass::Int => RawReturn::Int(by_arity!(addr, i64, i64, args;
            0 => [], 1 => [0], 2 => [0, 1], 3 => [0, 1, 2],
            4 => [0, 1, 2, 3], 5 => [0, 1, 2, 3, 4], 6 => [0, 1, 2, 3, 4, 5])),
        ReturnClass::Float => RawReturn::Float(by_arity!(addr, f64, i64, args;
            0 => [], 1 => [0], 2 => [0, 1], 3 => [0, 1, 2],
            4 => [0, 1, 2, 3], 5 => [0, 1, 2, 3, 4], 6 => [0, 1, 2, 3, 4, 5])),
    })
}

unsafe fn call_with_floats(addr: *const c_void, args: &[f64], ret: ReturnClass) -> Result<RawReturn, String> {
    Ok(match ret {
        ReturnClass::Void => {
            by_arity!(addr, (), f64, args; 1 => [0], 2 => [0, 1], 3 => [0, 1, 2]);
            RawReturn::Void
        }
        ReturnClass::Int => RawReturn::Int(by_arity!(addr, i64, f64, args;
            1 => [0], 2 => [0, 1], 3 => [0, 1, 2])),
        ReturnClass::Float => RawReturn::Float(by_arity!(addr, f64, f64, args;
            1 => [0], 2 => [0, 1], 3 => [0, 1, 2])),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CaptureHost;
    use crate::types::TypeTable;
    use anyhow::{anyhow, bail, Result};

    fn invoke(bridge: &ForeignBridge, target: &ResolvedTarget, args: &[Value]) -> Result<ForeignOutcome, InteropError> {
        let mut host = CaptureHost::new();
        let types = TypeTable::new();
        let mut ctx = CallContext::new(&mut host, &types);
        bridge.invoke(target, &mut ctx, args)
    }

    fn returned(outcome: Result<ForeignOutcome, InteropError>) -> Result<Option<Value>> {
        match outcome? {
            ForeignOutcome::Return(v) => Ok(v),
            other => bail!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_calling_convention_from_flags() {
        assert_eq!(
            CallingConvention::from_pinvoke_flags(0x0200 | 0x0001),
            Some(CallingConvention::Cdecl)
        );
        assert_eq!(CallingConvention::try_from(0x0300u16).ok(), Some(CallingConvention::StdCall));
        assert_eq!(CallingConvention::from_pinvoke_flags(0x0000), None);
        assert!(CallingConvention::Cdecl.is_c_abi());
    }

    #[test]
    fn test_internal_resolution_is_cached() -> Result<()> {
        let bridge = ForeignBridge::default();
        let d = ForeignDescriptor::internal("System.Console::WriteLine(string)");
        let first = bridge.resolve(&d)?;
        let second = bridge.resolve(&d)?;
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_internal());
        let stats = bridge.stats();
        assert_eq!(stats.resolutions, 1);
        assert_eq!(stats.cache_hits, 1);
        Ok(())
    }

    #[test]
    fn test_concurrent_resolution_converges() -> Result<()> {
        let bridge = ForeignBridge::default();
        let d = ForeignDescriptor::internal("System.Int32::ToString()");
        let targets = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| bridge.resolve(&d))).collect();
            handles
                .into_iter()
                .map(|h| Ok(h.join().map_err(|_| anyhow!("resolver thread panicked"))??))
                .collect::<Result<Vec<Arc<ResolvedTarget>>>>()
        })?;
        for t in &targets[1..] {
            assert!(Arc::ptr_eq(&targets[0], t));
        }
        assert_eq!(bridge.stats().resolutions, 1);
        Ok(())
    }

    #[test]
    fn test_unknown_internal_is_not_cached() {
        let bridge = ForeignBridge::default();
        let d = ForeignDescriptor::internal("Test.Nowhere::Missing()");
        for _ in 0..2 {
            assert_eq!(
                bridge.resolve(&d).err(),
                Some(ResolutionError::UnknownInternalOperation("Test.Nowhere::Missing()".to_string()))
            );
        }
        assert_eq!(bridge.stats(), BridgeStats::default());
    }

    #[test]
    fn test_internal_arity_and_tags_checked() -> Result<()> {
        let bridge = ForeignBridge::default();
        let target = bridge.resolve(&ForeignDescriptor::internal("System.Console::WriteLine(int32)"))?;
        assert!(matches!(
            invoke(&bridge, &target, &[]),
            Err(InteropError::ArityMismatch { expected: 1, actual: 0, .. })
        ));
        assert!(matches!(
            invoke(&bridge, &target, &[Value::string("x")]),
            Err(InteropError::TypeMismatch { index: 0, expected: ValueKind::I4, .. })
        ));
        assert_eq!(bridge.stats().internal_invocations, 0);
        Ok(())
    }

    #[test]
    fn test_library_not_found_lists_search_paths() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // Present but not a loadable library.
        std::fs::write(dir.path().join("libTestLibrary.so"), b"not an object file")?;
        let bridge = ForeignBridge::new(BridgeConfig::default().with_search_path(dir.path()));
        let d = ForeignDescriptor::external(
            "TestLibrary",
            "RuntimeDllImportCall",
            CallingConvention::Cdecl,
            Signature::new([ValueKind::I4], ValueKind::Void),
        );
        match bridge.resolve(&d) {
            Err(ResolutionError::LibraryNotFound { library, searched }) => {
                assert_eq!(library, "TestLibrary");
                assert!(searched.contains("libTestLibrary.so"));
            }
            other => bail!("unexpected {:?}", other),
        }
        assert_eq!(bridge.stats().native_invocations, 0);
        Ok(())
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    mod native {
        use super::*;

        fn libc(symbol: &str, signature: Signature) -> ForeignDescriptor {
            ForeignDescriptor::external("libc.so.6", symbol, CallingConvention::Cdecl, signature)
        }

        fn libm(symbol: &str, signature: Signature) -> ForeignDescriptor {
            ForeignDescriptor::external("libm.so.6", symbol, CallingConvention::Cdecl, signature)
        }

        #[test]
        fn test_integer_call() -> Result<()> {
            let bridge = ForeignBridge::default();
            let abs = bridge.resolve(&libc("abs", Signature::new([ValueKind::I4], ValueKind::I4)))?;
            assert_eq!(returned(invoke(&bridge, &abs, &[Value::I32(-42)]))?, Some(Value::I32(42)));
            assert_eq!(bridge.stats().native_invocations, 1);
            Ok(())
        }

        #[test]
        fn test_string_argument() -> Result<()> {
            let bridge = ForeignBridge::default();
            let strlen = bridge.resolve(&libc("strlen", Signature::new([ValueKind::String], ValueKind::I8)))?;
            assert_eq!(
                returned(invoke(&bridge, &strlen, &[Value::string("hello")]))?,
                Some(Value::I64(5))
            );
            assert!(matches!(
                invoke(&bridge, &strlen, &[Value::string("a\0b")]),
                Err(InteropError::MarshalingError { .. })
            ));
            Ok(())
        }

        #[test]
        fn test_float_calls() -> Result<()> {
            let bridge = ForeignBridge::default();
            let fabs = bridge.resolve(&libm("fabs", Signature::new([ValueKind::R8], ValueKind::R8)))?;
            assert_eq!(returned(invoke(&bridge, &fabs, &[Value::F64(-2.5)]))?, Some(Value::F64(2.5)));
            let pow = bridge.resolve(&libm("pow", Signature::new([ValueKind::R8, ValueKind::R8], ValueKind::R8)))?;
            assert_eq!(
                returned(invoke(&bridge, &pow, &[Value::F64(2.0), Value::F64(10.0)]))?,
                Some(Value::F64(1024.0))
            );
            Ok(())
        }

        #[test]
        fn test_library_shared_between_descriptors() -> Result<()> {
            let bridge = ForeignBridge::default();
            bridge.resolve(&libc("abs", Signature::new([ValueKind::I4], ValueKind::I4)))?;
            bridge.resolve(&libc("labs", Signature::new([ValueKind::I8], ValueKind::I8)))?;
            let loaded = bridge.libraries.libraries.read().unwrap_or_else(PoisonError::into_inner).len();
            assert_eq!(loaded, 1);
            Ok(())
        }

        #[test]
        fn test_symbol_not_found() {
            let bridge = ForeignBridge::default();
            let err = bridge.resolve(&libc("cascade_missing_symbol", Signature::new([], ValueKind::Void)));
            assert!(matches!(err, Err(ResolutionError::SymbolNotFound { .. })));
        }

        #[test]
        fn test_unsupported_shape_fails_before_the_call() -> Result<()> {
            let bridge = ForeignBridge::default();
            let mixed = bridge.resolve(&libm(
                "ldexp",
                Signature::new([ValueKind::R8, ValueKind::I4], ValueKind::R8),
            ))?;
            assert!(matches!(
                invoke(&bridge, &mixed, &[Value::F64(1.0), Value::I32(3)]),
                Err(InteropError::MarshalingError { .. })
            ));
            let object = bridge.resolve(&libc("abs", Signature::new([ValueKind::Object], ValueKind::I4)))?;
            assert!(matches!(
                invoke(&bridge, &object, &[Value::I32(1)]),
                Err(InteropError::MarshalingError { .. })
            ));
            assert_eq!(bridge.stats().native_invocations, 0);
            Ok(())
        }
    }
}
