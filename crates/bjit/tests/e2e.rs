//! End-to-end tests: build a procedure with `bjit_frontend::Builder`,
//! compile and load it with `bjit_jit::Module`, then call the result
//! through a transmuted function pointer (spec §8 "End-to-end scenarios").

use bjit::{Flags, Module, ProcIndex};
use bjit_codegen::ir::{Procedure, Type};
use bjit_frontend::Builder;
use target_lexicon::Triple;

fn host_module() -> Module {
    Module::host(&Triple::host())
}

#[test]
fn iadd_over_two_ints() {
    let mut module = host_module();
    let flags = Flags::default();

    let mut proc = Procedure::new(vec![Type::Int, Type::Int]);
    {
        let mut b = Builder::new(&mut proc);
        let a = b.arg(Type::Int, 0, 2, 0).unwrap();
        let c = b.arg(Type::Int, 1, 2, 1).unwrap();
        let sum = b.iadd(a, c).unwrap();
        b.ret(Some(sum)).unwrap();
    }
    let idx = module.compile(&mut proc, &flags).unwrap();
    module.load(0).unwrap();

    let f: extern "C" fn(i64, i64) -> i64 = unsafe { module.get_proc(idx).unwrap() };
    assert_eq!(f(2, 5), 7);
}

#[test]
fn fadd_over_two_floats() {
    let mut module = host_module();
    let flags = Flags::default();

    let mut proc = Procedure::new(vec![Type::F32, Type::F32]);
    {
        let mut b = Builder::new(&mut proc);
        let a = b.arg(Type::F32, 0, 2, 0).unwrap();
        let c = b.arg(Type::F32, 1, 2, 1).unwrap();
        let sum = b.fadd(a, c).unwrap();
        b.ret(Some(sum)).unwrap();
    }
    let idx = module.compile(&mut proc, &flags).unwrap();
    module.load(0).unwrap();

    let f: extern "C" fn(f32, f32) -> f32 = unsafe { module.get_proc(idx).unwrap() };
    assert_eq!(f(2.0, 5.0), 7.0);
}

#[test]
fn recursive_fibonacci_via_call_near() {
    let mut module = host_module();
    let flags = Flags::default();

    // `compile` assigns indices sequentially, so a procedure that calls
    // itself can predict its own module index before it is compiled (spec
    // §6 "near call emitters").
    let self_index = ProcIndex::from_raw(module.proc_count() as i32);

    let mut proc = Procedure::new(vec![Type::Int]);
    {
        let mut b = Builder::new(&mut proc);
        let n = b.arg(Type::Int, 0, 1, 0).unwrap();
        let two = b.iconst(2).unwrap();

        let base_case = b.new_label();
        let recursive_case = b.new_label();
        b.br_ilt(n, two, base_case, recursive_case).unwrap();

        b.switch_to(base_case);
        b.ret(Some(n)).unwrap();

        b.switch_to(recursive_case);
        let n1 = b.isub_imm(n, 1).unwrap();
        b.pass_all(&[n1]).unwrap();
        let fib1 = b.call_near(self_index.as_i32(), Type::Int).unwrap();
        let n2 = b.isub_imm(n, 2).unwrap();
        b.pass_all(&[n2]).unwrap();
        let fib2 = b.call_near(self_index.as_i32(), Type::Int).unwrap();
        let sum = b.iadd(fib1, fib2).unwrap();
        b.ret(Some(sum)).unwrap();
    }
    let idx = module.compile(&mut proc, &flags).unwrap();
    assert_eq!(idx, self_index);
    module.load(0).unwrap();

    let fib: extern "C" fn(i64) -> i64 = unsafe { module.get_proc(idx).unwrap() };
    assert_eq!(fib(16), 1597);
}

#[test]
fn sieve_of_eratosthenes() {
    const SIZE: usize = 819_000;

    let mut module = host_module();
    let flags = Flags::default();

    // sieve(buf: *mut u8, n: i64) -> i64
    //
    // buf[i] is nonzero while i is still considered prime. Every byte is
    // set to 1 for i in [2, n), then multiples of each surviving i are
    // zeroed, then the remaining nonzero bytes are counted.
    let mut proc = Procedure::new(vec![Type::Int, Type::Int]);
    {
        let mut b = Builder::new(&mut proc);
        let ptr = b.arg(Type::Int, 0, 2, 0).unwrap();
        let n = b.arg(Type::Int, 1, 2, 1).unwrap();

        let zero = b.iconst(0).unwrap();
        let one = b.iconst(1).unwrap();
        let two = b.iconst(2).unwrap();

        // Every local this procedure will ever touch must be declared
        // before the first label is created (spec §4.1: a label's phi
        // count is fixed at `new_label` time).
        let i_var = b.declare_var(two);
        let j_var = b.declare_var(zero);
        let i2_var = b.declare_var(two);
        let count_var = b.declare_var(zero);

        let init_head = b.new_label();
        let init_body = b.new_label();
        let init_done = b.new_label();

        let sieve_head = b.new_label();
        let sieve_body = b.new_label();
        let mark_composites = b.new_label();
        let inner_head = b.new_label();
        let inner_body = b.new_label();
        let inner_done = b.new_label();
        let next_candidate = b.new_label();
        let sieve_done = b.new_label();

        let count_head = b.new_label();
        let count_body = b.new_label();
        let count_done = b.new_label();

        // Pass 1: mark every index in [2, n) as (provisionally) prime.
        b.jump(init_head).unwrap();
        b.switch_to(init_head);
        let iv = b.read_var(i_var);
        b.br_ilt(iv, n, init_body, init_done).unwrap();

        b.switch_to(init_body);
        let iv = b.read_var(i_var);
        b.store2(8, false, ptr, iv, one, 0).unwrap();
        let next = b.iadd_imm(iv, 1).unwrap();
        b.write_var(i_var, next);
        b.jump(init_head).unwrap();

        b.switch_to(init_done);
        b.write_var(i2_var, two);

        // Pass 2: for every surviving candidate, zero its multiples
        // starting at its square.
        b.jump(sieve_head).unwrap();
        b.switch_to(sieve_head);
        let iv = b.read_var(i2_var);
        b.br_ilt(iv, n, sieve_body, sieve_done).unwrap();

        b.switch_to(sieve_body);
        let iv = b.read_var(i2_var);
        let flag = b.load2(8, false, false, ptr, iv, 0).unwrap();
        b.br_ieq(flag, zero, next_candidate, mark_composites).unwrap();

        b.switch_to(mark_composites);
        let iv = b.read_var(i2_var);
        let start = b.imul(iv, iv).unwrap();
        b.write_var(j_var, start);
        b.jump(inner_head).unwrap();

        b.switch_to(inner_head);
        let jv = b.read_var(j_var);
        b.br_ilt(jv, n, inner_body, inner_done).unwrap();

        b.switch_to(inner_body);
        let jv = b.read_var(j_var);
        b.store2(8, false, ptr, jv, zero, 0).unwrap();
        let iv = b.read_var(i2_var);
        let jnext = b.iadd(jv, iv).unwrap();
        b.write_var(j_var, jnext);
        b.jump(inner_head).unwrap();

        b.switch_to(inner_done);
        b.jump(next_candidate).unwrap();

        b.switch_to(next_candidate);
        let iv = b.read_var(i2_var);
        let inext = b.iadd_imm(iv, 1).unwrap();
        b.write_var(i2_var, inext);
        b.jump(sieve_head).unwrap();

        b.switch_to(sieve_done);
        b.write_var(i_var, two);

        // Pass 3: count the survivors.
        b.jump(count_head).unwrap();
        b.switch_to(count_head);
        let iv = b.read_var(i_var);
        b.br_ilt(iv, n, count_body, count_done).unwrap();

        b.switch_to(count_body);
        let iv = b.read_var(i_var);
        let flag = b.load2(8, false, false, ptr, iv, 0).unwrap();
        let is_prime = b.icmp_ne(flag, zero).unwrap();
        let count = b.read_var(count_var);
        let count = b.iadd(count, is_prime).unwrap();
        b.write_var(count_var, count);
        let inext = b.iadd_imm(iv, 1).unwrap();
        b.write_var(i_var, inext);
        b.jump(count_head).unwrap();

        b.switch_to(count_done);
        let result = b.read_var(count_var);
        b.ret(Some(result)).unwrap();
    }
    let idx = module.compile(&mut proc, &flags).unwrap();
    module.load(0).unwrap();

    let sieve: extern "C" fn(*mut u8, i64) -> i64 = unsafe { module.get_proc(idx).unwrap() };

    let mut buf = vec![0u8; SIZE];
    let count = sieve(buf.as_mut_ptr(), SIZE as i64);
    assert_eq!(count, 65057);
}

#[test]
fn stub_retargeting_survives_unload_reload() {
    extern "C" fn hello() -> i64 {
        42
    }
    extern "C" fn hello_again() -> i64 {
        45
    }

    let mut module = host_module();
    let flags = Flags::default();

    let stub = module.compile_stub(hello as usize);

    let mut caller = Procedure::new(vec![]);
    {
        let mut b = Builder::new(&mut caller);
        let result = b.call_near(stub.as_i32(), Type::Int).unwrap();
        b.ret(Some(result)).unwrap();
    }
    let caller_idx = module.compile(&mut caller, &flags).unwrap();

    module.load(0).unwrap();
    let call: extern "C" fn() -> i64 = unsafe { module.get_proc(caller_idx).unwrap() };
    assert_eq!(call(), 42);

    module.unload().unwrap();
    module.patch_stub(stub, hello_again as usize);
    module.load(0).unwrap();
    let call: extern "C" fn() -> i64 = unsafe { module.get_proc(caller_idx).unwrap() };
    assert_eq!(call(), 45);
}

#[test]
fn load_store_covers_every_scalar_width() {
    struct Field {
        name: &'static str,
        width: u32,
        signed: bool,
        float: bool,
        offset: i32,
        ty: Type,
    }

    let fields = [
        Field { name: "i8", width: 8, signed: true, float: false, offset: 0, ty: Type::Int },
        Field { name: "u8", width: 8, signed: false, float: false, offset: 1, ty: Type::Int },
        Field { name: "i16", width: 16, signed: true, float: false, offset: 2, ty: Type::Int },
        Field { name: "u16", width: 16, signed: false, float: false, offset: 4, ty: Type::Int },
        Field { name: "i32", width: 32, signed: true, float: false, offset: 8, ty: Type::Int },
        Field { name: "u32", width: 32, signed: false, float: false, offset: 12, ty: Type::Int },
        Field { name: "i64", width: 64, signed: true, float: false, offset: 16, ty: Type::Int },
        Field { name: "f32", width: 32, signed: false, float: true, offset: 24, ty: Type::F32 },
        Field { name: "f64", width: 64, signed: false, float: true, offset: 32, ty: Type::F64 },
    ];

    let mut module = host_module();
    let flags = Flags::default();

    let mut getters = Vec::new();
    let mut setters = Vec::new();
    for f in &fields {
        let mut getter = Procedure::new(vec![Type::Int]);
        {
            let mut b = Builder::new(&mut getter);
            let ptr = b.arg(Type::Int, 0, 1, 0).unwrap();
            let v = b.load(f.width, f.signed, f.float, ptr, f.offset).unwrap();
            b.ret(Some(v)).unwrap();
        }
        getters.push(module.compile(&mut getter, &flags).unwrap());

        let arg_types = vec![Type::Int, f.ty];
        let mut setter = Procedure::new(arg_types);
        {
            let mut b = Builder::new(&mut setter);
            let (ptr, value) = if f.float {
                (b.arg(Type::Int, 0, 1, 0).unwrap(), b.arg(f.ty, 0, 1, 1).unwrap())
            } else {
                (b.arg(Type::Int, 0, 2, 0).unwrap(), b.arg(Type::Int, 1, 2, 1).unwrap())
            };
            b.store(f.width, f.float, ptr, value, f.offset).unwrap();
            b.ret(None).unwrap();
        }
        setters.push(module.compile(&mut setter, &flags).unwrap());
    }

    module.load(0).unwrap();

    let mut buf = vec![0u8; 40];
    let ptr = buf.as_mut_ptr();

    unsafe {
        let set: extern "C" fn(*mut u8, i64) = module.get_proc(setters[0]).unwrap();
        let get: extern "C" fn(*mut u8) -> i64 = module.get_proc(getters[0]).unwrap();
        set(ptr, -5);
        assert_eq!(get(ptr), -5, "{}", fields[0].name);

        let set: extern "C" fn(*mut u8, i64) = module.get_proc(setters[1]).unwrap();
        let get: extern "C" fn(*mut u8) -> i64 = module.get_proc(getters[1]).unwrap();
        set(ptr, 200);
        assert_eq!(get(ptr), 200, "{}", fields[1].name);

        let set: extern "C" fn(*mut u8, i64) = module.get_proc(setters[2]).unwrap();
        let get: extern "C" fn(*mut u8) -> i64 = module.get_proc(getters[2]).unwrap();
        set(ptr, -1234);
        assert_eq!(get(ptr), -1234, "{}", fields[2].name);

        let set: extern "C" fn(*mut u8, i64) = module.get_proc(setters[3]).unwrap();
        let get: extern "C" fn(*mut u8) -> i64 = module.get_proc(getters[3]).unwrap();
        set(ptr, 60000);
        assert_eq!(get(ptr), 60000, "{}", fields[3].name);

        let set: extern "C" fn(*mut u8, i64) = module.get_proc(setters[4]).unwrap();
        let get: extern "C" fn(*mut u8) -> i64 = module.get_proc(getters[4]).unwrap();
        set(ptr, -123456);
        assert_eq!(get(ptr), -123456, "{}", fields[4].name);

        let set: extern "C" fn(*mut u8, i64) = module.get_proc(setters[5]).unwrap();
        let get: extern "C" fn(*mut u8) -> i64 = module.get_proc(getters[5]).unwrap();
        set(ptr, 3_000_000_000);
        assert_eq!(get(ptr), 3_000_000_000, "{}", fields[5].name);

        let set: extern "C" fn(*mut u8, i64) = module.get_proc(setters[6]).unwrap();
        let get: extern "C" fn(*mut u8) -> i64 = module.get_proc(getters[6]).unwrap();
        set(ptr, 123_456_789_012_345);
        assert_eq!(get(ptr), 123_456_789_012_345, "{}", fields[6].name);

        let set: extern "C" fn(*mut u8, f32) = module.get_proc(setters[7]).unwrap();
        let get: extern "C" fn(*mut u8) -> f32 = module.get_proc(getters[7]).unwrap();
        set(ptr, 3.5);
        assert_eq!(get(ptr), 3.5, "{}", fields[7].name);

        let set: extern "C" fn(*mut u8, f64) = module.get_proc(setters[8]).unwrap();
        let get: extern "C" fn(*mut u8) -> f64 = module.get_proc(getters[8]).unwrap();
        set(ptr, 2.718281828);
        assert_eq!(get(ptr), 2.718281828, "{}", fields[8].name);
    }
}
