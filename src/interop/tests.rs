//! Test suite for the interop layer: native calls and callbacks

use std::sync::Arc;

use super::new_closure;
use crate::config::EngineConfig;
use crate::core::{CFunction, CType, RecordBuilder};
use crate::engine::{Engine, EngineState};
use crate::errors::ErrorKind;
use crate::host::{HostFunction, HostHandle, Value};
use crate::CData;

// Test helpers
extern "C" fn add_i32(a: i32, b: i32) -> i32 {
    a + b
}

extern "C" fn mul_f64(a: f64, b: f64) -> f64 {
    a * b
}

extern "C" fn identity_ptr(ptr: *const core::ffi::c_void) -> *const core::ffi::c_void {
    ptr
}

extern "C" fn no_args() -> i32 {
    42
}

extern "C" fn negate_i8(x: i8) -> i8 {
    x.wrapping_neg()
}

extern "C" fn max_i64() -> i64 {
    i64::MAX
}

extern "C" fn is_positive(x: i32) -> bool {
    x > 0
}

extern "C" fn apply(f: extern "C" fn(i32) -> i32, x: i32) -> i32 {
    f(x)
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Pair {
    a: i32,
    b: f64,
}

extern "C" fn pair_sum(p: Pair) -> f64 {
    p.a as f64 + p.b
}

extern "C" fn make_pair(a: i32, b: f64) -> Pair {
    Pair { a, b }
}

fn native(engine: &Engine, ret: CType, params: Vec<CType>, f: *const ()) -> CData {
    let ty = CType::function(CFunction::new(ret, params, false)).pointer_to();
    engine
        .cast(ty, &Value::Handle(HostHandle::from_ptr(f)))
        .unwrap()
}

fn pair_type() -> CType {
    RecordBuilder::new_struct("pair")
        .field("a", CType::int())
        .field("b", CType::double())
        .build_type()
        .unwrap()
}

fn callback_type() -> CType {
    CType::function(CFunction::new(CType::int(), vec![CType::int()], false)).pointer_to()
}

#[test]
fn test_call_add_i32() {
    let engine = Engine::new();
    let f = native(&engine, CType::int(), vec![CType::int(), CType::int()], add_i32 as *const ());
    let out = engine.call(&f, &[Value::Integer(2), Value::Integer(40)]).unwrap();
    assert!(matches!(out.as_slice(), [Value::Integer(42)]));
}

#[test]
fn test_call_mul_f64() {
    let engine = Engine::new();
    let f = native(&engine, CType::double(), vec![CType::double(), CType::double()], mul_f64 as *const ());
    let out = engine.call(&f, &[Value::Number(1.5), Value::Integer(4)]).unwrap();
    assert!(matches!(out.as_slice(), [Value::Number(n)] if *n == 6.0));
}

#[test]
fn test_call_no_args() {
    let engine = Engine::new();
    let f = native(&engine, CType::int(), vec![], no_args as *const ());
    let out = engine.call(&f, &[]).unwrap();
    assert!(matches!(out.as_slice(), [Value::Integer(42)]));

    let err = engine.call(&f, &[Value::Integer(1)]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ArgumentCount { expected: 0, got: 1 });
}

#[test]
fn test_pointer_passthrough() {
    let engine = Engine::new();
    let vp = CType::void().pointer_to();
    let f = native(&engine, vp.clone(), vec![vp], identity_ptr as *const ());

    let out = engine.call(&f, &[Value::Nil]).unwrap();
    match out.as_slice() {
        [Value::CData(p)] => assert_eq!(p.to_display(), "cdata<void *>: NULL"),
        other => panic!("unexpected {:?}", other),
    }

    let handle = Value::Handle(HostHandle(0x1000));
    let out = engine.call(&f, &[handle]).unwrap();
    match out.as_slice() {
        [Value::CData(p)] => assert_eq!(p.pointer_value(), Some(0x1000 as *mut u8)),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_narrow_returns() {
    let engine = Engine::new();
    let sc = CType::new(crate::core::CKind::SChar);
    let f = native(&engine, sc.clone(), vec![sc], negate_i8 as *const ());
    let out = engine.call(&f, &[Value::Integer(5)]).unwrap();
    assert!(matches!(out.as_slice(), [Value::Integer(-5)]));

    let f = native(&engine, CType::bool(), vec![CType::int()], is_positive as *const ());
    let out = engine.call(&f, &[Value::Integer(-3)]).unwrap();
    assert!(matches!(out.as_slice(), [Value::Boolean(false)]));
}

#[test]
fn test_int64_return_is_boxed() {
    let engine = Engine::new();
    let f = native(&engine, CType::llong(), vec![], max_i64 as *const ());
    let out = engine.call(&f, &[]).unwrap();
    match out.as_slice() {
        [Value::CData(v)] => assert_eq!(v.to_display(), "9223372036854775807LL"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_out_of_range_argument() {
    let engine = Engine::new();
    let sc = CType::new(crate::core::CKind::SChar);
    let f = native(&engine, sc.clone(), vec![sc], negate_i8 as *const ());
    let err = engine.call(&f, &[Value::Integer(300)]).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::OutOfRangeConversion { .. }));
    assert_eq!(engine.stats().marshaling_errors, 1);
}

#[test]
fn test_struct_by_value() {
    let engine = Engine::new();
    let pair = pair_type();

    let sum = native(&engine, CType::double(), vec![pair.clone()], pair_sum as *const ());
    let init = crate::host::Table::sequence(vec![Value::Integer(2), Value::Number(0.5)]);
    let p = engine.new_value(&pair, &[Value::Table(init)]).unwrap();
    let out = engine.call(&sum, &[Value::CData(p)]).unwrap();
    assert!(matches!(out.as_slice(), [Value::Number(n)] if *n == 2.5));

    let make = native(&engine, pair.clone(), vec![CType::int(), CType::double()], make_pair as *const ());
    let out = engine.call(&make, &[Value::Integer(7), Value::Number(1.25)]).unwrap();
    let returned = match out.as_slice() {
        [Value::CData(cd)] => cd.clone(),
        other => panic!("unexpected {:?}", other),
    };
    // returned aggregates are owned copies
    assert!(returned.bytes().is_some());
    assert!(matches!(engine.index(&returned, &Value::string("a")).unwrap(), Value::Integer(7)));
    assert!(matches!(engine.index(&returned, &Value::string("b")).unwrap(), Value::Number(n) if n == 1.25));
}

#[test]
fn test_callback_argument() {
    let engine = Engine::new();
    let apply_fn = native(&engine, CType::int(), vec![callback_type(), CType::int()], apply as *const ());
    let add_one = HostFunction::new(|args| {
        let x = args[0].as_integer().unwrap_or(0);
        Ok(vec![Value::Integer(x + 1)])
    });

    let out = engine
        .call(&apply_fn, &[Value::Function(add_one), Value::Integer(41)])
        .unwrap();
    assert!(matches!(out.as_slice(), [Value::Integer(42)]));
    assert_eq!(engine.stats().callbacks_invoked, 1);
}

#[test]
fn test_callback_error_surfaces() {
    let engine = Engine::new();
    let apply_fn = native(&engine, CType::int(), vec![callback_type(), CType::int()], apply as *const ());
    let failing = HostFunction::new(|_| Err(crate::errors::FfiError::host("boom")));

    let err = engine
        .call(&apply_fn, &[Value::Function(failing), Value::Integer(1)])
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::HostError { message: "boom".to_string() });
    assert!(engine.take_callback_error().is_none());
}

#[test]
fn test_closure_lifecycle() {
    let engine = Engine::new();
    let add_one = Value::function(|args| Ok(vec![Value::Integer(args[0].as_integer().unwrap_or(0) + 1)]));
    let cb = engine.new_value(callback_type(), &[add_one]).unwrap();
    assert!(cb.is_closure());

    let code = cb.pointer_value().unwrap();
    let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(code) };
    assert_eq!(f(41), 42);

    // rebinding keeps the code pointer
    let set = engine.index(&cb, &Value::string("set")).unwrap();
    let double = Value::function(|args| Ok(vec![Value::Integer(args[0].as_integer().unwrap_or(0) * 2)]));
    match set {
        Value::Function(set) => set.call(&[Value::CData(cb.clone()), double]).unwrap(),
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(cb.pointer_value().unwrap(), code);
    assert_eq!(f(21), 42);

    let free = engine.index(&cb, &Value::string("free")).unwrap();
    let free = match free {
        Value::Function(free) => free,
        other => panic!("unexpected {:?}", other),
    };
    free.call(&[Value::CData(cb.clone())]).unwrap();

    // freed: native calls return zero and report, host calls are refused
    assert_eq!(f(1), 0);
    let err = engine.take_callback_error().unwrap();
    assert_eq!(err.kind, ErrorKind::BadCallbackState { state: "freed" });
    let err = engine.call(&cb, &[Value::Integer(1)]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadCallbackState { state: "freed" });
    let err = free.call(&[Value::CData(cb.clone())]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadCallbackState { state: "freed" });
}

#[test]
fn test_never_bound_closure() {
    let state = Arc::new(EngineState::new(EngineConfig::default()));
    let cb = new_closure(&state, &callback_type(), None).unwrap();
    let trampoline = cb.trampoline().unwrap().clone();
    assert_eq!(trampoline.state_name(), "unbound");

    let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(cb.pointer_value().unwrap()) };
    assert_eq!(f(5), 0);
    let err = state.take_callback_error().unwrap();
    assert_eq!(err.kind, ErrorKind::BadCallbackState { state: "unbound" });

    // only an armed trampoline can be freed; binding arms it
    let err = trampoline.free().unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadCallbackState { state: "unbound" });
    trampoline
        .bind(HostFunction::new(|args| Ok(vec![args[0].clone()])))
        .unwrap();
    assert!(trampoline.is_armed());
    assert_eq!(f(5), 5);
    assert!(state.take_callback_error().is_none());
}

#[test]
fn test_null_function_pointer() {
    let engine = Engine::new();
    let cb = engine.new_value(callback_type(), &[]);
    // a function pointer without a function is a plain NULL pointer
    let cb = cb.unwrap();
    assert!(!cb.is_closure());
    let err = engine.call(&cb, &[Value::Integer(1)]).unwrap_err();
    assert!(err.is_type_mismatch());
}

#[test]
fn test_interop_stats() {
    let engine = Engine::new();
    let stats = engine.stats();
    assert_eq!(stats.calls_made, 0);
    assert_eq!(stats.marshaling_errors, 0);

    let f = native(&engine, CType::int(), vec![], no_args as *const ());
    engine.call(&f, &[]).unwrap();
    engine.call(&f, &[]).unwrap();
    assert_eq!(engine.stats().calls_made, 2);
}
