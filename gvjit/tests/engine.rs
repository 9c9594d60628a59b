///
/// End-to-end engine tests on the Cranelift backend.
///
/// Each test builds a small program in memory, hands it to a fresh engine
/// and checks results through `invoke` or raw addresses.
///
/// Run all:  `cargo test --test engine`
///

use gvjit::ir::{Constant, Expr, Stmt};
use gvjit::{
    EngineConfig, Entity, GenericValue, HostSymbols, JitEngine, JitError, Module, Signature, Type,
};

fn ret(expr: Expr) -> Vec<Stmt> {
    vec![Stmt::Return(Some(expr))]
}

fn engine(module: Module) -> JitEngine {
    JitEngine::new(module, EngineConfig::default()).unwrap()
}

fn engine_with(module: Module, config: EngineConfig) -> JitEngine {
    JitEngine::new(module, config).unwrap()
}

#[test]
fn test_answer_through_nullary_entry() {
    let mut module = Module::new("m");
    let answer =
        module.define_function("answer", Signature::new(&[], Type::I32), ret(Expr::i32(42)));

    let engine = engine(module);
    assert_eq!(engine.invoke(answer, &[]).unwrap(), GenericValue::I32(42));
}

#[test]
fn test_add_through_call_stub() {
    let mut module = Module::new("m");
    let add = module.define_function(
        "add",
        Signature::new(&[Type::I32, Type::I32], Type::I32),
        ret(Expr::add(Expr::param(0), Expr::param(1))),
    );

    let engine = engine(module);
    let result = engine
        .invoke(add, &[GenericValue::I32(2), GenericValue::I32(3)])
        .unwrap();
    assert_eq!(result, GenericValue::I32(5));

    // The stub is gone again: module and cache only know `add`.
    assert!(engine.module().function_by_name("__gv_stub.0").is_none());
    assert!(engine.lookup(Entity::Function(add)).is_some());
}

#[test]
fn test_fast_path_and_stub_path_agree() {
    fn build() -> (Module, gvjit::FunctionId) {
        let mut module = Module::new("m");
        let entry = module.define_function(
            "entry",
            Signature::new(&[Type::I32, Type::Ptr, Type::Ptr], Type::I32),
            ret(Expr::mul(Expr::param(0), Expr::i32(10))),
        );
        (module, entry)
    }
    let null = GenericValue::ptr(std::ptr::null::<u8>());
    let args = [GenericValue::I32(3), null, null];

    let (module, entry) = build();
    let fast = engine(module).invoke(entry, &args).unwrap();

    let (module, entry) = build();
    let config = EngineConfig {
        fast_path: false,
        ..EngineConfig::default()
    };
    let slow = engine_with(module, config).invoke(entry, &args).unwrap();

    assert_eq!(fast, GenericValue::I32(30));
    assert_eq!(fast, slow);
}

#[test]
fn test_unsigned_entry_result_keeps_its_tag() {
    let mut module = Module::new("m");
    let neg = module.define_function(
        "wrap",
        Signature::new(&[Type::U32], Type::U32),
        ret(Expr::sub(Expr::int(Type::U32, 0), Expr::param(0))),
    );

    let engine = engine(module);
    let result = engine.invoke(neg, &[GenericValue::U32(1)]).unwrap();
    assert_eq!(result, GenericValue::U32(u32::MAX));
}

#[test]
fn test_scalar_types_through_stubs() {
    let mut module = Module::new("m");
    let mix = module.define_function(
        "mix",
        Signature::new(&[Type::F64, Type::I32], Type::F64),
        ret(Expr::add(Expr::param(0), Expr::cast(Type::F64, Expr::param(1)))),
    );
    let positive = module.define_function(
        "nonzero",
        Signature::new(&[Type::I64], Type::Bool),
        ret(Expr::cast(Type::Bool, Expr::param(0))),
    );
    let low_byte = module.define_function(
        "low_byte",
        Signature::new(&[Type::U16], Type::U8),
        ret(Expr::cast(Type::U8, Expr::param(0))),
    );
    let widen = module.define_function(
        "widen",
        Signature::new(&[Type::I8], Type::I64),
        ret(Expr::cast(Type::I64, Expr::param(0))),
    );

    let engine = engine(module);
    assert_eq!(
        engine
            .invoke(mix, &[GenericValue::F64(1.5), GenericValue::I32(2)])
            .unwrap(),
        GenericValue::F64(3.5)
    );
    assert_eq!(
        engine.invoke(positive, &[GenericValue::I64(9)]).unwrap(),
        GenericValue::Bool(true)
    );
    assert_eq!(
        engine.invoke(positive, &[GenericValue::I64(0)]).unwrap(),
        GenericValue::Bool(false)
    );
    assert_eq!(
        engine.invoke(low_byte, &[GenericValue::U16(0x1234)]).unwrap(),
        GenericValue::U8(0x34)
    );
    assert_eq!(
        engine.invoke(widen, &[GenericValue::I8(-5)]).unwrap(),
        GenericValue::I64(-5)
    );
}

#[test]
fn test_argument_checks() {
    let mut module = Module::new("m");
    let add = module.define_function(
        "add",
        Signature::new(&[Type::I32, Type::I32], Type::I32),
        ret(Expr::add(Expr::param(0), Expr::param(1))),
    );

    let engine = engine(module);
    let err = engine.invoke(add, &[GenericValue::I32(1)]).unwrap_err();
    assert!(matches!(err, JitError::ArgumentCount { expected: 2, found: 1, .. }));
    assert!(err.to_string().contains("'add'"));

    let err = engine
        .invoke(add, &[GenericValue::I32(1), GenericValue::U32(1)])
        .unwrap_err();
    assert!(matches!(
        err,
        JitError::ArgumentType {
            index: 1,
            expected: Type::I32,
            found: Type::U32,
            ..
        }
    ));

    // Rejected before anything was compiled.
    assert!(engine.lookup(Entity::Function(add)).is_none());
}

#[test]
fn test_void_function_writes_global() {
    let mut module = Module::new("m");
    let counter = module.define_global("counter", Type::I32, Some(Constant::int(Type::I32, 5)));
    let set = module.define_function(
        "set",
        Signature::new(&[Type::I32], Type::Void),
        vec![
            Stmt::Store {
                addr: Expr::GlobalAddr(counter),
                value: Expr::add(Expr::param(0), Expr::load(Type::I32, Expr::GlobalAddr(counter))),
            },
            Stmt::Return(None),
        ],
    );

    let engine = engine(module);
    assert_eq!(engine.invoke(set, &[GenericValue::I32(10)]).unwrap(), GenericValue::Void);

    let storage = engine.pointer_to_global(counter).unwrap();
    assert_eq!(unsafe { *(storage.as_ptr() as *const i32) }, 15);
}

#[test]
fn test_global_initializers_reference_globals_and_functions() {
    let mut module = Module::new("m");
    let value = module.define_global("value", Type::I64, Some(Constant::int(Type::I64, 7)));
    let slot = module.define_global("slot", Type::Ptr, Some(Constant::GlobalAddr(value)));
    let answer =
        module.define_function("answer", Signature::new(&[], Type::I32), ret(Expr::i32(42)));
    let callback = module.define_global("callback", Type::Ptr, Some(Constant::FuncAddr(answer)));
    let read = module.define_function(
        "read",
        Signature::new(&[], Type::I64),
        ret(Expr::load(Type::I64, Expr::load(Type::Ptr, Expr::GlobalAddr(slot)))),
    );

    let engine = engine(module);
    assert_eq!(engine.invoke(read, &[]).unwrap(), GenericValue::I64(7));
    assert_eq!(engine.pending_globals(), 0);

    let callback = engine.pointer_to_global(callback).unwrap();
    let target = unsafe { *(callback.as_ptr() as *const *const u8) };
    assert!(!target.is_null());
    let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(target) };
    assert_eq!(f(), 42);
}

#[test]
fn test_lazy_stub_compiles_on_first_call() {
    let mut module = Module::new("m");
    let answer =
        module.define_function("answer", Signature::new(&[], Type::I32), ret(Expr::i32(42)));

    let engine = engine(module);
    let stub = engine.pointer_to_function_or_stub(answer).unwrap();
    assert!(engine.lookup(Entity::Function(answer)).is_none());

    let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(stub.as_ptr()) };
    assert_eq!(f(), 42);
    let compiled = engine.lookup(Entity::Function(answer)).unwrap();
    assert_ne!(compiled, stub);

    // Once compiled the real address is handed out.
    assert_eq!(engine.pointer_to_function_or_stub(answer).unwrap(), compiled);
}

#[test]
fn test_call_chain_through_lazy_stubs() {
    let mut module = Module::new("m");
    let c = module.define_function(
        "c",
        Signature::new(&[Type::I64], Type::I64),
        ret(Expr::add(Expr::param(0), Expr::i64(1))),
    );
    let b = module.define_function(
        "b",
        Signature::new(&[Type::I64], Type::I64),
        ret(Expr::mul(Expr::call(c, vec![Expr::param(0)]), Expr::i64(2))),
    );
    let a = module.define_function(
        "a",
        Signature::new(&[], Type::I64),
        ret(Expr::call(b, vec![Expr::i64(4)])),
    );

    let engine = engine(module);
    assert_eq!(engine.invoke(a, &[]).unwrap(), GenericValue::I64(10));
    assert!(engine.lookup(Entity::Function(b)).is_some());
    assert!(engine.lookup(Entity::Function(c)).is_some());
    assert_eq!(engine.invoke(a, &[]).unwrap(), GenericValue::I64(10));
}

#[test]
fn test_eager_mode_rejects_uncompiled_callee() {
    let mut module = Module::new("m");
    let b = module.define_function("b", Signature::new(&[], Type::I32), ret(Expr::i32(1)));
    let a = module.define_function(
        "a",
        Signature::new(&[], Type::I32),
        ret(Expr::call(b, vec![])),
    );
    let config = EngineConfig {
        lazy_stubs: false,
        ..EngineConfig::default()
    };

    let engine = engine_with(module, config);
    let err = engine.ensure_compiled(a).unwrap_err();
    match &err {
        JitError::RecursiveCompilation { function, active } => {
            assert_eq!(function, "b");
            assert_eq!(active, "a");
        }
        other => panic!("expected RecursiveCompilation, got {}", other),
    }
    assert!(engine.lookup(Entity::Function(a)).is_none());
    assert!(!engine.is_compiling());

    // With the callee compiled first the call goes through its address.
    engine.ensure_compiled(b).unwrap();
    assert_eq!(engine.invoke(a, &[]).unwrap(), GenericValue::I32(1));
}

#[test]
fn test_self_reference_and_deferred_bodies() {
    let mut module = Module::new("m");
    let me = module.define_lazy_function("me", Signature::new(&[], Type::Ptr));
    let broken = module.define_lazy_function("broken", Signature::new(&[], Type::I32));
    module.set_body_source(move |name: &str, _sig: &Signature| match name {
        "me" => Ok(vec![Stmt::Return(Some(Expr::FuncAddr(me)))]),
        _ => Err(format!("no body for {}", name)),
    });

    let engine = engine(module);
    let result = engine.invoke(me, &[]).unwrap();
    let address = engine.lookup(Entity::Function(me)).unwrap();
    assert_eq!(result.as_ptr(), Some(address.as_mut_ptr() as *mut std::ffi::c_void));

    for _ in 0..2 {
        let err = engine.ensure_compiled(broken).unwrap_err();
        match &err {
            JitError::Materialization { function, reason } => {
                assert_eq!(function, "broken");
                assert_eq!(reason, "no body for broken");
            }
            other => panic!("expected Materialization, got {}", other),
        }
        assert!(engine.lookup(Entity::Function(broken)).is_none());
    }
}

#[test]
fn test_missing_body_source() {
    let mut module = Module::new("m");
    let later = module.define_lazy_function("later", Signature::new(&[], Type::I32));

    let engine = engine(module);
    let err = engine.invoke(later, &[]).unwrap_err();
    assert!(err.to_string().contains("no body source"));
}

extern "C" fn host_triple(x: i32) -> i32 {
    x * 3
}

static HOST_VALUE: i32 = 41;

#[test]
fn test_registered_host_symbols() {
    let mut module = Module::new("m");
    let triple = module.declare_function("host_triple", Signature::new(&[Type::I32], Type::I32));
    let host_value = module.declare_global("host_value", Type::I32);
    let f = module.define_function(
        "f",
        Signature::new(&[Type::I32], Type::I32),
        ret(Expr::add(
            Expr::call(triple, vec![Expr::param(0)]),
            Expr::load(Type::I32, Expr::GlobalAddr(host_value)),
        )),
    );

    let mut symbols = HostSymbols::isolated();
    symbols
        .symbol("host_triple", host_triple as *const u8)
        .symbol("host_value", &HOST_VALUE as *const i32 as *const u8);
    let engine = JitEngine::builder(module).symbols(symbols).build().unwrap();

    assert_eq!(engine.invoke(f, &[GenericValue::I32(5)]).unwrap(), GenericValue::I32(56));
    assert_eq!(
        engine.lookup(Entity::Function(triple)).unwrap().as_ptr(),
        host_triple as *const u8
    );
    // External storage is used as is; nothing was queued for it.
    assert_eq!(
        engine.pointer_to_global(host_value).unwrap().as_ptr(),
        &HOST_VALUE as *const i32 as *const u8
    );
}

#[test]
fn test_unresolved_external() {
    let mut module = Module::new("m");
    let missing = module.declare_function("gvjit_missing_symbol", Signature::new(&[], Type::Void));
    let f = module.define_function(
        "f",
        Signature::new(&[], Type::Void),
        vec![Stmt::Eval(Expr::call(missing, vec![])), Stmt::Return(None)],
    );

    let engine = JitEngine::builder(module)
        .symbols(HostSymbols::isolated())
        .build()
        .unwrap();
    let err = engine.invoke(f, &[]).unwrap_err();
    assert!(matches!(
        err,
        JitError::UnresolvedSymbol { ref name } if name == "gvjit_missing_symbol"
    ));
    assert!(engine.lookup(Entity::Function(f)).is_none());
}

#[cfg(unix)]
#[test]
fn test_dynamic_symbol_lookup() {
    let mut module = Module::new("m");
    let abs = module.declare_function("abs", Signature::new(&[Type::I32], Type::I32));

    let engine = engine(module);
    assert_eq!(engine.invoke(abs, &[GenericValue::I32(-7)]).unwrap(), GenericValue::I32(7));
}

#[test]
fn test_ill_typed_body_is_a_compile_error() {
    let mut module = Module::new("m");
    let bad = module.define_function(
        "bad",
        Signature::new(&[Type::I32], Type::I32),
        ret(Expr::add(Expr::param(0), Expr::i64(1))),
    );
    let short = module.define_function("short", Signature::new(&[], Type::I32), vec![]);

    let engine = engine(module);
    let err = engine.ensure_compiled(bad).unwrap_err();
    assert!(matches!(err, JitError::Compile { ref function, .. } if function == "bad"));
    assert!(err.to_string().contains("differ"));

    let err = engine.ensure_compiled(short).unwrap_err();
    assert!(err.to_string().contains("missing return"));
    assert!(!engine.is_compiling());
}

#[cfg(target_pointer_width = "64")]
#[test]
fn test_stub_rendering() {
    let mut module = Module::new("m");
    let scale = module.define_function(
        "scale",
        Signature::new(&[Type::Ptr, Type::I64], Type::I64),
        ret(Expr::mul(Expr::param(1), Expr::i64(2))),
    );
    let config = EngineConfig {
        discard_stubs: false,
        ..EngineConfig::default()
    };

    let engine = engine_with(module, config);
    let result = engine
        .invoke(scale, &[GenericValue::ptr(0x1000 as *const u8), GenericValue::I64(-3)])
        .unwrap();
    assert_eq!(result, GenericValue::I64(-6));

    let module = engine.module();
    let stub = module.function_by_name("__gv_stub.0").unwrap();
    let text = module.display_function(stub).unwrap().to_string();
    insta::assert_snapshot!(text, @r"
    fn __gv_stub.0() -> i64 {
        return call scale(cast ptr i64 4096, i64 -3)
    }
    ");
}
