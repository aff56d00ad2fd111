use cffi::{CType, Engine, RecordBuilder, Value};
use proptest::prelude::*;

fn read_int(engine: &Engine, v: &cffi::CData) -> i64 {
    engine.tonumber(&Value::CData(v.clone())).unwrap().as_integer().unwrap()
}

proptest! {
    #[test]
    fn int_values_survive_storage(x in any::<i32>()) {
        let engine = Engine::new();
        let v = engine.new_value("int", &[Value::Integer(x as i64)]).unwrap();
        prop_assert_eq!(read_int(&engine, &v), x as i64);
    }

    #[test]
    fn uchar_conversion_checks_range(x in -1000i64..1000) {
        let engine = Engine::new();
        let converted = engine.new_value("unsigned char", &[Value::Integer(x)]);
        prop_assert_eq!(converted.is_ok(), (0..=255).contains(&x));

        // casting keeps the low byte
        let cast = engine.cast("unsigned char", &Value::Integer(x)).unwrap();
        prop_assert_eq!(read_int(&engine, &cast), x.rem_euclid(256));
    }

    #[test]
    fn short_cast_wraps(x in any::<i64>()) {
        let engine = Engine::new();
        let cast = engine.cast("short", &Value::Integer(x)).unwrap();
        prop_assert_eq!(read_int(&engine, &cast), x as i16 as i64);
    }

    #[test]
    fn struct_fields_are_aligned(kinds in proptest::collection::vec(0usize..5, 1..8)) {
        let palette = [CType::char(), CType::short(), CType::int(), CType::double(), CType::llong()];
        let mut builder = RecordBuilder::new_struct("prop_layout");
        for (i, k) in kinds.iter().enumerate() {
            builder = builder.field(&format!("f{}", i), palette[*k].clone());
        }
        let ty = builder.build_type().unwrap();
        let rec = ty.as_record().unwrap();

        let mut end = 0;
        for (i, k) in kinds.iter().enumerate() {
            let (offset, fty) = rec.field_offset(&format!("f{}", i)).unwrap();
            prop_assert_eq!(offset % fty.align(), 0);
            prop_assert!(offset >= end);
            end = offset + palette[*k].alloc_size().unwrap();
        }
        let size = ty.alloc_size().unwrap();
        prop_assert!(size >= end);
        prop_assert_eq!(size % ty.align(), 0);
    }

    #[test]
    fn pointer_arithmetic_scales(n in -64i64..64) {
        let engine = Engine::new();
        let p = engine.cast("double *", &Value::Integer(0x10000)).unwrap();
        let q = engine.arith(cffi::ArithOp::Add, &Value::CData(p.clone()), &Value::Integer(n)).unwrap();
        let q = q.as_cdata().unwrap().clone();
        prop_assert_eq!(q.pointer_value().unwrap() as i64, 0x10000 + n * 8);

        let diff = engine.arith(cffi::ArithOp::Sub, &Value::CData(q), &Value::CData(p)).unwrap();
        prop_assert!(matches!(diff, Value::Integer(d) if d == n));
    }
}
