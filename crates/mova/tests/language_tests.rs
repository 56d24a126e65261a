//! End-to-end tests driving the full pipeline: source text through the
//! lexer, parser, and compiler, executed on the VM.

use mova::{Value, Vm, compile};
use pretty_assertions::assert_eq;

/// Run a program and return its printed lines.
fn run(source: &str) -> Vec<String> {
    let module = compile(source).expect("program should compile");
    let mut vm = Vm::new();
    vm.run(&module).expect("program should run");
    vm.take_output()
}

/// Run a program and return its final value.
fn eval(source: &str) -> Value {
    let module = compile(source).expect("program should compile");
    let mut vm = Vm::new();
    vm.run(&module).expect("program should run")
}

/// Run a program expecting a runtime failure.
fn run_err(source: &str) -> mova::Error {
    let module = compile(source).expect("program should compile");
    let mut vm = Vm::new();
    vm.run(&module).expect_err("program should fail")
}

#[test]
fn test_fibonacci() {
    let output = run("fun fib(n){ if n<2 { return n } return fib(n-1)+fib(n-2) } print(fib(10))");
    assert_eq!(output, vec!["55"]);
}

#[test]
fn test_counter_closure_shares_one_cell() {
    let output = run(
        "var c = 0; fun inc(){ c = c + 1; return c } print(inc()); print(inc()); print(inc())",
    );
    assert_eq!(output, vec!["1", "2", "3"]);
}

#[test]
fn test_list_indexing_and_length() {
    let output = run("let xs = [1,2,3,4,5]; print(xs[0]); print(xs.length)");
    assert_eq!(output, vec!["1", "5"]);
}

#[test]
fn test_class_instance_and_bound_method() {
    let output = run(
        "class Point(x,y){ fun dist(){ return (self.x**2 + self.y**2) ** 0.5 } } \
         let p = new Point(3,4); print(p.dist())",
    );
    assert_eq!(output, vec!["5"]);
}

#[test]
fn test_pipe_chain() {
    let output = run("fun dbl(x){ return x*2 } fun inc(x){ return x+1 } print(10 |> dbl |> inc)");
    assert_eq!(output, vec!["21"]);
}

#[test]
fn test_match_guard() {
    let output =
        run("match 7 { 0 => print(\"z\"), n if n > 5 => print(\"big\"), _ => print(\"other\") }");
    assert_eq!(output, vec!["big"]);
}

// ---------------------------------------------------------------------------
// Negative scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_arity_mismatch() {
    let err = run_err("fun add(a, b) { return a + b } add(1)");
    let message = err.to_string();
    assert!(message.contains("arity"), "got: {}", message);
    assert!(message.contains("add"), "got: {}", message);
}

#[test]
fn test_method_arity_mismatch() {
    let err = run_err("class C(x) { fun get(a, b) { return a } } let c = new C(1) c.get(9)");
    assert!(err.to_string().contains("arity"));
}

#[test]
fn test_empty_list_index_out_of_bounds() {
    let err = run_err("let xs = [] print(xs[0])");
    assert!(err.to_string().contains("bounds"));
}

#[test]
fn test_division_by_zero() {
    let err = run_err("print(1 / 0)");
    assert!(err.to_string().contains("Division by zero"));
    let err = run_err("print(5 % 0)");
    assert!(err.to_string().contains("Division by zero"));
}

#[test]
fn test_undefined_field() {
    let err = run_err("class C(x) {} let c = new C(1) print(c.y)");
    assert!(err.to_string().contains("undefined field or method 'y'"));
}

#[test]
fn test_forward_reference_left_unresolved() {
    // The global slot exists, but nothing ever stored the class.
    let err = run_err("fun make() { return new Ghost() } make()");
    assert!(err.to_string().contains("undefined global 'Ghost'"));
}

#[test]
fn test_calling_a_non_function() {
    let err = run_err("let x = 3 x(1)");
    assert!(err.to_string().contains("not callable"));
}

// ---------------------------------------------------------------------------
// Control flow and operators
// ---------------------------------------------------------------------------

#[test]
fn test_while_loop() {
    let output = run("var i = 0 var total = 0 while i < 5 { total = total + i i = i + 1 } print(total)");
    assert_eq!(output, vec!["10"]);
}

#[test]
fn test_else_if_chain() {
    let source = "fun grade(n) {
                      if n >= 90 { return \"A\" }
                      else if n >= 80 { return \"B\" }
                      else if n >= 70 { return \"C\" }
                      else { return \"F\" }
                  }
                  print(grade(95), grade(85), grade(71), grade(10))";
    assert_eq!(run(source), vec!["A B C F"]);
}

#[test]
fn test_integer_purity() {
    assert_eq!(eval("return 2 + 3"), Value::Int(5));
    assert_eq!(eval("return 10 / 4"), Value::Int(2));
    assert_eq!(eval("return 2 ** 8"), Value::Int(256));
    assert_eq!(eval("return 2 + 3.0"), Value::Float(5.0));
    assert_eq!(eval("return 10 / 4.0"), Value::Float(2.5));
    assert_eq!(eval("return 25 ** 0.5"), Value::Float(5.0));
}

#[test]
fn test_string_operators() {
    let output = run("print(\"count: \" + 3) print(\"ab\" * 3) print(\"a\" < \"b\")");
    assert_eq!(output, vec!["count: 3", "ababab", "true"]);
}

#[test]
fn test_list_concatenation() {
    let output = run("let xs = [1, 2] + [3] print(xs) print(xs.length)");
    assert_eq!(output, vec!["[1, 2, 3]", "3"]);
}

#[test]
fn test_eager_logic_operators() {
    let output = run("print(1 && 2) print(0 || \"\") print(!none)");
    assert_eq!(output, vec!["true", "false", "true"]);
}

#[test]
fn test_truthiness_in_conditions() {
    let output = run("if [1] { print(\"list\") } if \"\" { print(\"no\") } else { print(\"empty\") }");
    assert_eq!(output, vec!["list", "empty"]);
}

#[test]
fn test_unary_and_power_precedence() {
    // Power binds tighter than unary minus; power is right-associative.
    assert_eq!(eval("return -2 ** 2"), Value::Int(-4));
    assert_eq!(eval("return 2 ** 3 ** 2"), Value::Int(512));
}

#[test]
fn test_compound_assignment() {
    let output = run("var x = 10 x += 5 x -= 3 print(x)");
    assert_eq!(output, vec!["12"]);
}

#[test]
fn test_assignment_is_an_expression() {
    let output = run("var x = 0 var y = 0 y = (x = 41) + 1 print(x, y)");
    assert_eq!(output, vec!["41 42"]);
}

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

#[test]
fn test_map_literal_and_indexing() {
    let output = run("let m = { name: \"Ada\", \"age\": 36 } print(m[\"name\"]) print(m[\"age\"])");
    assert_eq!(output, vec!["Ada", "36"]);
}

#[test]
fn test_index_assignment_mutates_in_place() {
    let output = run("let xs = [1, 2, 3] xs[1] = 20 print(xs)");
    assert_eq!(output, vec!["[1, 20, 3]"]);
}

#[test]
fn test_map_assignment_inserts_and_updates() {
    let output = run("let m = { a: 1 } m[\"a\"] = 2 m[\"b\"] = 3 print(m)");
    assert_eq!(output, vec!["{a: 2, b: 3}"]);
}

#[test]
fn test_lists_are_shared_by_reference() {
    let output = run("let xs = [1] let ys = xs ys[0] = 9 print(xs)");
    assert_eq!(output, vec!["[9]"]);
}

#[test]
fn test_field_assignment() {
    let output = run("class P(x, y) {} let p = new P(1, 2) p.x = 10 print(p.x, p.y)");
    assert_eq!(output, vec!["10 2"]);
}

#[test]
fn test_missing_constructor_args_leave_fields_absent() {
    let err = run_err("class P(x, y) {} let p = new P(1) print(p.y)");
    assert!(err.to_string().contains("undefined field or method 'y'"));
}

#[test]
fn test_extra_constructor_args_are_ignored() {
    let output = run("class P(x) {} let p = new P(1, 2, 3) print(p.x)");
    assert_eq!(output, vec!["1"]);
}

#[test]
fn test_data_declaration_is_a_methodless_class() {
    let output = run("data Pair(a, b) let p = new Pair(1, 2) print(p.a, p.b)");
    assert_eq!(output, vec!["1 2"]);
}

#[test]
fn test_method_argument_plus_receiver() {
    let output = run(
        "class Acc(total) {
             fun add(n) { self.total = self.total + n return self.total }
         }
         let a = new Acc(0)
         a.add(5)
         print(a.add(7))",
    );
    assert_eq!(output, vec!["12"]);
}

#[test]
fn test_forward_class_reference_resolves_after_declaration() {
    let output = run("fun make() { return new Point(1, 2) } class Point(x, y) {} print(make().x)");
    assert_eq!(output, vec!["1"]);
}

// ---------------------------------------------------------------------------
// Functions and closures
// ---------------------------------------------------------------------------

#[test]
fn test_lambda_forms() {
    let output = run(
        "let f = (x) -> x + 1
         let g = (x, y) => x * y
         let h = (x) -> { return x - 1 }
         print(f(1), g(2, 3), h(10))",
    );
    assert_eq!(output, vec!["2 6 9"]);
}

#[test]
fn test_lambda_captures_enclosing_local() {
    let output = run(
        "fun adder(n) { return (x) -> x + n }
         let add5 = adder(5)
         print(add5(10))",
    );
    assert_eq!(output, vec!["15"]);
}

#[test]
fn test_two_closures_from_one_declaration_share_the_cell() {
    let output = run(
        "var total = 0
         fun bump() { total = total + 1 return total }
         let a = bump
         let b = bump
         a()
         b()
         print(a())",
    );
    assert_eq!(output, vec!["3"]);
}

#[test]
fn test_pipe_equivalence_with_direct_call() {
    let piped = eval("fun f(x) { return x * 3 } return 7 |> f");
    let direct = eval("fun f(x) { return x * 3 } return f(7)");
    assert_eq!(piped, direct);
}

#[test]
fn test_functions_are_values() {
    let output = run("fun twice(f, x) { return f(f(x)) } fun inc(x) { return x + 1 } print(twice(inc, 5))");
    assert_eq!(output, vec!["7"]);
}

#[test]
fn test_recursion_through_globals() {
    let output = run(
        "fun fact(n) { if n < 2 { return 1 } return n * fact(n - 1) }
         print(fact(10))",
    );
    assert_eq!(output, vec!["3628800"]);
}

#[test]
fn test_implicit_return_is_none() {
    assert_eq!(eval("fun f() { 1 + 1 } return f()"), Value::None);
}

// ---------------------------------------------------------------------------
// Match
// ---------------------------------------------------------------------------

#[test]
fn test_match_is_an_expression() {
    let output = run("let label = match 2 { 1 => \"one\", 2 => \"two\", _ => \"many\" } print(label)");
    assert_eq!(output, vec!["two"]);
}

#[test]
fn test_match_without_matching_arm_yields_none() {
    assert_eq!(eval("return match 9 { 1 => \"one\" }"), Value::None);
}

#[test]
fn test_match_range_pattern_is_half_open() {
    let source = "fun bucket(n) { return match n { 0..10 => \"low\", 10..100 => \"mid\", _ => \"high\" } }";
    let output = run(&format!(
        "{} print(bucket(0), bucket(9), bucket(10), bucket(100))",
        source
    ));
    assert_eq!(output, vec!["low low mid high"]);
}

#[test]
fn test_match_binding_visible_to_guard_and_body() {
    let output = run("print(match 6 { n if n % 2 == 0 => n * 10, _ => -1 })");
    assert_eq!(output, vec!["60"]);
}

#[test]
fn test_match_failed_guard_falls_through() {
    let output = run("print(match 3 { n if n > 5 => \"big\", m => \"small \" + m })");
    assert_eq!(output, vec!["small 3"]);
}

#[test]
fn test_match_on_strings_and_none() {
    let output = run("print(match \"hi\" { \"hi\" => 1, _ => 2 }) print(match none { none => \"n\", _ => \"o\" })");
    assert_eq!(output, vec!["1", "n"]);
}

// ---------------------------------------------------------------------------
// Builtins and the bilingual surface
// ---------------------------------------------------------------------------

#[test]
fn test_builtins_end_to_end() {
    let output = run(
        "print(abs(-4))
         print(sqrt(16.0))
         print(min(3, 1, 2), max([4, 9]))
         print(len(\"hello\"), len([1, 2]))
         print(upper(\"ab\"), trim(\"  x  \"))
         print(join(split(\"a,b,c\", \",\"), \"-\"))
         print(sum(range(1, 5)))
         print(int(\"42\") + 1, str(5.0), type([]))",
    );
    assert_eq!(
        output,
        vec!["4", "4", "1 9", "5 2", "AB x", "a-b-c", "10", "43 5 list"]
    );
}

#[test]
fn test_builtin_type_mismatch_is_clean() {
    let err = run_err("len(5)");
    assert!(err.to_string().contains("len() expects"));
}

#[test]
fn test_ukrainian_surface_matches_english() {
    let english = run("let total = 0 print(total + 1)");
    let ukrainian = run("нехай всього = 0 друк(всього + 1)");
    assert_eq!(english, ukrainian);
}

#[test]
fn test_mixed_surfaces_in_one_program() {
    let output = run(
        "функція square(x) { повернути x * x }
         нехай n = 7
         if n > 0 { друк(square(n)) }",
    );
    assert_eq!(output, vec!["49"]);
}

#[test]
fn test_self_alias_in_methods() {
    let output = run(
        "клас Лічильник(значення) {
             функція далі() { себе.значення = себе.значення + 1 повернути себе.значення }
         }
         нехай л = новий Лічильник(0)
         л.далі()
         друк(л.далі())",
    );
    assert_eq!(output, vec!["2"]);
}

// ---------------------------------------------------------------------------
// Errors carry positions
// ---------------------------------------------------------------------------

#[test]
fn test_parse_error_position() {
    let err = compile("let = 5").unwrap_err();
    assert!(err.to_string().starts_with("parse error at 1:5"));
}

#[test]
fn test_lexical_error_position() {
    let err = compile("\n\n  \"unfinished").unwrap_err();
    assert!(err.to_string().starts_with("lexical error at 3:3"));
}

#[test]
fn test_reserved_surface_is_refused_with_position() {
    let err = compile("break").unwrap_err();
    assert!(err.to_string().contains("parse error at 1:1"));
    assert!(compile("for x in [1] {}").is_err());
    assert!(compile("await f()").is_err());
    assert!(compile("spawn f()").is_err());
    assert!(compile("trait T {}").is_err());
}
