//! Calls into the C library of the running process
#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cffi::{ArrayLen, CFunction, CType, Decl, Engine, ErrorKind, Value};

fn declare_function(engine: &Engine, name: &str, ret: CType, params: Vec<CType>, variadic: bool) {
    engine
        .declare(name, Decl::Function(CType::function(CFunction::new(ret, params, variadic))))
        .unwrap();
}

fn call(engine: &Engine, name: &str, args: &[Value]) -> Vec<Value> {
    let c = engine.namespace().unwrap();
    let f = c.get(name).unwrap();
    engine.call(f.as_cdata().unwrap(), args).unwrap()
}

fn size_t() -> CType {
    Engine::new().decls().type_named("size_t").unwrap()
}

#[test]
fn test_abs_and_strlen() {
    let engine = Engine::new();
    declare_function(&engine, "abs", CType::int(), vec![CType::int()], false);
    declare_function(&engine, "strlen", size_t(), vec![CType::char().as_const().pointer_to()], false);

    let out = call(&engine, "abs", &[Value::Integer(-12)]);
    assert!(matches!(out.as_slice(), [Value::Integer(12)]));

    let out = call(&engine, "strlen", &[Value::string("hello")]);
    let n = engine.tonumber(&out[0]).unwrap();
    assert!(matches!(n, Value::Integer(5)));
}

#[test]
fn test_variadic_snprintf() {
    let engine = Engine::new();
    declare_function(
        &engine,
        "snprintf",
        CType::int(),
        vec![CType::char().pointer_to(), size_t(), CType::char().as_const().pointer_to()],
        true,
    );

    let buf = engine.new_value(CType::char().array_of(ArrayLen::Fixed(64)), &[]).unwrap();
    let out = call(
        &engine,
        "snprintf",
        &[
            Value::CData(buf.clone()),
            Value::Integer(64),
            Value::string("%d-%s-%.1f"),
            Value::Integer(7),
            Value::string("x"),
            Value::Number(2.5),
        ],
    );
    assert!(matches!(out.as_slice(), [Value::Integer(7)]));
    let s = engine.string(&Value::CData(buf), None).unwrap();
    assert_eq!(s.as_str().unwrap().to_string_lossy(), "7-x-2.5");
}

#[test]
fn test_qsort_with_callback() {
    let engine = Engine::new();
    let vp = CType::void().pointer_to();
    let cvp = CType::void().as_const().pointer_to();
    let cmp = CType::function(CFunction::new(CType::int(), vec![cvp.clone(), cvp], false)).pointer_to();
    declare_function(&engine, "qsort", CType::void(), vec![vp, size_t(), size_t(), cmp], false);

    let values = [5, 3, 9, 1, 7];
    let arr = engine
        .new_value(
            CType::int().array_of(ArrayLen::Fixed(values.len())),
            &values.iter().map(|v| Value::Integer(*v)).collect::<Vec<_>>(),
        )
        .unwrap();

    let comparisons = Arc::new(AtomicUsize::new(0));
    let compare = {
        let engine = engine.clone();
        let comparisons = comparisons.clone();
        Value::function(move |args| {
            comparisons.fetch_add(1, Ordering::SeqCst);
            let read = |v: &Value| -> cffi::FfiResult<i64> {
                let p = engine.cast("int *", v)?;
                Ok(engine.index(&p, &Value::Integer(0))?.as_integer().unwrap_or(0))
            };
            let (a, b) = (read(&args[0])?, read(&args[1])?);
            Ok(vec![Value::Integer((a > b) as i64 - (a < b) as i64)])
        })
    };

    let out = call(
        &engine,
        "qsort",
        &[Value::CData(arr.clone()), Value::Integer(5), Value::Integer(4), compare],
    );
    assert!(out.is_empty());
    assert!(comparisons.load(Ordering::SeqCst) > 0);

    let sorted: Vec<i64> = (0..5)
        .map(|i| engine.index(&arr, &Value::Integer(i)).unwrap().as_integer().unwrap())
        .collect();
    assert_eq!(sorted, vec![1, 3, 5, 7, 9]);
    assert!(engine.stats().callbacks_invoked >= comparisons.load(Ordering::SeqCst));
}

#[test]
fn test_callback_error_survives_nested_calls() {
    let engine = Engine::new();
    let vp = CType::void().pointer_to();
    let cvp = CType::void().as_const().pointer_to();
    let cmp = CType::function(CFunction::new(CType::int(), vec![cvp.clone(), cvp], false)).pointer_to();
    declare_function(&engine, "qsort", CType::void(), vec![vp, size_t(), size_t(), cmp], false);
    declare_function(&engine, "abs", CType::int(), vec![CType::int()], false);

    let arr = engine
        .new_value(
            CType::int().array_of(ArrayLen::Fixed(4)),
            &[Value::Integer(4), Value::Integer(2), Value::Integer(3), Value::Integer(1)],
        )
        .unwrap();

    let comparisons = Arc::new(AtomicUsize::new(0));
    let compare = {
        let engine = engine.clone();
        let comparisons = comparisons.clone();
        Value::function(move |_| {
            if comparisons.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(cffi::FfiError::host("comparator failed"));
            }
            // later activations make a native call of their own
            let c = engine.namespace()?;
            let abs = c.get("abs")?;
            let out = engine.call(abs.as_cdata().unwrap(), &[Value::Integer(-1)])?;
            assert!(matches!(out.as_slice(), [Value::Integer(1)]));
            Ok(vec![Value::Integer(0)])
        })
    };

    let c = engine.namespace().unwrap();
    let qsort = c.get("qsort").unwrap();
    let err = engine
        .call(
            qsort.as_cdata().unwrap(),
            &[Value::CData(arr), Value::Integer(4), Value::Integer(4), compare],
        )
        .unwrap_err();
    assert!(comparisons.load(Ordering::SeqCst) > 1);
    assert!(err.to_string().contains("comparator failed"));
    assert!(engine.take_callback_error().is_none());
}

#[test]
fn test_namespace_errors() {
    let engine = Engine::new();
    declare_function(&engine, "abs", CType::int(), vec![CType::int()], false);
    engine
        .declare("cffi_missing_symbol_xyz", Decl::Function(CType::function(CFunction::new(CType::void(), vec![], false))))
        .unwrap();
    engine.declare("answer", Decl::Constant { ty: CType::int(), value: 42 }).unwrap();

    let c = engine.namespace().unwrap();
    assert_eq!(c.to_string(), "library: default");
    assert!(matches!(c.get("answer").unwrap(), Value::Integer(42)));

    let err = c.get("abz").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::UnknownMember { .. }));
    assert!(err.suggestions.iter().any(|s| s.contains("abs")));

    let err = c.get("cffi_missing_symbol_xyz").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::UnknownMember { ref name, .. } if name == "cffi_missing_symbol_xyz"));

    let err = c.set("abs", &Value::Integer(1)).unwrap_err();
    assert!(err.is_type_mismatch());
}

#[test]
fn test_load_missing_library() {
    let engine = Engine::new();
    let err = engine.load("cffi-no-such-library", None).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::LibraryLoad { .. }));
    assert_eq!(engine.stats().libraries_loaded, 0);
}

#[test]
fn test_errno_roundtrip() {
    let engine = Engine::new();
    let previous = engine.errno(Some(34));
    assert_eq!(engine.errno(None), 34);
    engine.errno(Some(previous));
}
