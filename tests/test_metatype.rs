use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cffi::{ArithOp, CData, CType, Engine, ErrorKind, RecordBuilder, Table, Value};

fn vec2(name: &str) -> CType {
    RecordBuilder::new_struct(name)
        .field("x", CType::double())
        .field("y", CType::double())
        .build_type()
        .unwrap()
}

fn field(engine: &Engine, cd: &CData, name: &str) -> f64 {
    engine.index(cd, &Value::string(name)).unwrap().as_number().unwrap()
}

/// Reads slot `i` of the two doubles without going through the metatype
fn slot(engine: &Engine, cd: &CData, i: i64) -> f64 {
    let p = engine.addressof(cd).unwrap();
    let p = engine.cast("double *", &Value::CData(p)).unwrap();
    engine.index(&p, &Value::Integer(i)).unwrap().as_number().unwrap()
}

fn arg(args: &[Value], i: usize) -> CData {
    args[i].as_cdata().unwrap().clone()
}

#[test]
fn test_registration_is_one_shot() {
    let engine = Engine::new();
    let ty = vec2("vec_once");
    engine.metatype(&ty, Table::new()).unwrap();

    let err = engine.metatype(&ty, Table::new()).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::ProtectedRegistration { .. }));

    let err = engine.metatype("int", Table::new()).unwrap_err();
    assert!(err.is_type_mismatch());
}

#[test]
fn test_marker_constructs() {
    let engine = Engine::new();
    let ty = vec2("vec_ctor");
    let marker = engine.metatype(&ty, Table::new()).unwrap();
    assert!(marker.is_type_marker());

    let out = engine.call(&marker, &[Value::Number(1.0), Value::Number(2.0)]).unwrap();
    let v = out[0].as_cdata().unwrap().clone();
    assert_eq!(field(&engine, &v, "y"), 2.0);
}

#[test]
fn test_index_table_and_methods() {
    let engine = Engine::new();
    let ty = vec2("vec_methods");

    let length = {
        let engine = engine.clone();
        Value::function(move |args| {
            let v = arg(args, 0);
            let (x, y) = (slot(&engine, &v, 0), slot(&engine, &v, 1));
            Ok(vec![Value::Number((x * x + y * y).sqrt())])
        })
    };
    let methods = Table::from_pairs(vec![("length", length), ("kind", Value::string("vector"))]);
    let meta = Table::from_pairs(vec![("__index", Value::Table(methods))]);
    engine.metatype(&ty, meta).unwrap();

    let v = engine.new_value(&ty, &[Value::Number(3.0), Value::Number(4.0)]).unwrap();
    let method = engine.index(&v, &Value::string("length")).unwrap();
    let out = match method {
        Value::Function(f) => f.call(&[Value::CData(v.clone())]).unwrap(),
        other => panic!("unexpected {:?}", other),
    };
    assert!(matches!(out.as_slice(), [Value::Number(n)] if *n == 5.0));

    // the capability is consulted first, even for real field names
    assert!(engine.index(&v, &Value::string("x")).unwrap().is_nil());
    let kind = engine.index(&v, &Value::string("kind")).unwrap();
    assert_eq!(kind.as_str().unwrap().to_string_lossy(), "vector");

    // pointers to the record share the capability
    let p = engine.addressof(&v).unwrap();
    assert!(matches!(engine.index(&p, &Value::string("length")).unwrap(), Value::Function(_)));
}

#[test]
fn test_index_function_and_newindex() {
    let engine = Engine::new();
    let ty = vec2("vec_hooks");
    let writes = Arc::new(AtomicUsize::new(0));

    let index = Value::function(|args| {
        let key = args[1].as_str().map(|s| s.to_string_lossy()).unwrap_or_default();
        Ok(vec![Value::string(&format!("virtual:{}", key))])
    });
    let newindex = {
        let writes = writes.clone();
        Value::function(move |args| {
            assert_eq!(args.len(), 3);
            writes.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        })
    };
    let meta = Table::from_pairs(vec![("__index", index), ("__newindex", newindex)]);
    engine.metatype(&ty, meta).unwrap();

    let v = engine.new_value(&ty, &[]).unwrap();
    let got = engine.index(&v, &Value::string("speed")).unwrap();
    assert_eq!(got.as_str().unwrap().to_string_lossy(), "virtual:speed");

    engine.newindex(&v, &Value::string("x"), &Value::Number(9.0)).unwrap();
    assert_eq!(writes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_operators() {
    let engine = Engine::new();
    let ty = vec2("vec_ops");
    let add = {
        let engine = engine.clone();
        let ty = ty.clone();
        Value::function(move |args| {
            let (a, b) = (arg(args, 0), arg(args, 1));
            let sum = engine.new_value(
                &ty,
                &[
                    Value::Number(field(&engine, &a, "x") + field(&engine, &b, "x")),
                    Value::Number(field(&engine, &a, "y") + field(&engine, &b, "y")),
                ],
            )?;
            Ok(vec![Value::CData(sum)])
        })
    };
    let eq = {
        let engine = engine.clone();
        Value::function(move |args| {
            let (a, b) = (arg(args, 0), arg(args, 1));
            Ok(vec![Value::Boolean(field(&engine, &a, "x") == field(&engine, &b, "x"))])
        })
    };
    let tostring = {
        let engine = engine.clone();
        Value::function(move |args| {
            let a = arg(args, 0);
            Ok(vec![Value::string(&format!("({}, {})", field(&engine, &a, "x"), field(&engine, &a, "y")))])
        })
    };
    let len = Value::function(|_| Ok(vec![Value::Integer(2)]));
    let meta = Table::from_pairs(vec![
        ("__add", add),
        ("__eq", eq),
        ("__tostring", tostring),
        ("__len", len),
    ]);
    engine.metatype(&ty, meta).unwrap();

    let a = engine.new_value(&ty, &[Value::Number(1.0), Value::Number(2.0)]).unwrap();
    let b = engine.new_value(&ty, &[Value::Number(1.0), Value::Number(5.0)]).unwrap();

    let sum = engine.arith(ArithOp::Add, &Value::CData(a.clone()), &Value::CData(b.clone())).unwrap();
    let sum = sum.as_cdata().unwrap().clone();
    assert_eq!(engine.tostring(&sum).unwrap(), "(2, 7)");

    assert!(engine.eq(&Value::CData(a.clone()), &Value::CData(b)).unwrap());
    assert!(matches!(engine.len(&a).unwrap(), Value::Integer(2)));

    // no __sub registered and records have no built-in subtraction
    let err = engine.arith(ArithOp::Sub, &Value::CData(a.clone()), &Value::CData(sum)).unwrap_err();
    assert!(err.is_type_mismatch());
    assert!(engine.concat(&Value::CData(a), &Value::string("x")).is_err());
}

#[test]
fn test_call_capability_receives_value() {
    let engine = Engine::new();
    let ty = vec2("vec_call");
    let call = Value::function(|args| Ok(vec![Value::Integer(args.len() as i64)]));
    engine.metatype(&ty, Table::from_pairs(vec![("__call", call)])).unwrap();

    let v = engine.new_value(&ty, &[]).unwrap();
    let out = engine.call(&v, &[Value::Integer(1), Value::Integer(2)]).unwrap();
    assert!(matches!(out.as_slice(), [Value::Integer(3)]));
}

#[test]
fn test_gc_capability_runs_after_finalizer() {
    let engine = Engine::new();
    let ty = vec2("vec_gc");
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let meta_gc = {
        let order = order.clone();
        Value::function(move |_| {
            order.lock().push("meta");
            Ok(Vec::new())
        })
    };
    engine.metatype(&ty, Table::from_pairs(vec![("__gc", meta_gc)])).unwrap();

    let fin = {
        let order = order.clone();
        Value::function(move |_| {
            order.lock().push("finalizer");
            Ok(Vec::new())
        })
    };
    let v = engine.new_value(&ty, &[]).unwrap();
    engine.gc(&v, &fin).unwrap();
    drop(v);

    assert_eq!(*order.lock(), vec!["finalizer", "meta"]);
}

#[test]
fn test_metatypes_are_engine_scoped() {
    let first = Engine::new();
    let second = Engine::new();
    let ty = vec2("vec_scoped");
    let kind = Table::from_pairs(vec![("tag", Value::Integer(1))]);
    first
        .metatype(&ty, Table::from_pairs(vec![("__index", Value::Table(kind))]))
        .unwrap();

    let v = second.new_value(&ty, &[Value::Number(4.0)]).unwrap();
    // the other engine's table is invisible here; built-in indexing applies
    assert_eq!(field(&second, &v, "x"), 4.0);
}
