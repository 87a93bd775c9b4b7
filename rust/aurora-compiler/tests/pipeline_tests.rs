//! End-to-end compiler pipeline tests: source in, AIL out.

use aurora_compiler::compiler::ail::{Instruction, LabelTable, Opcode, Program, StaticObject};
use aurora_compiler::compiler::emit::{emit_json, read_json};
use aurora_compiler::{compile, CompileError};

fn ops(program: &Program) -> Vec<Opcode> {
    program.instructions.iter().filter_map(Instruction::opcode).collect()
}

#[test]
fn tail_recursive_loop_uses_tailcall() {
    let program = compile(
        "(define (loop n) (if (= n 0) 'done (loop (- n 1))))
         (display (loop 100000))",
    )
    .unwrap();
    let text = program.to_ail_text();
    assert!(text.contains("tailcall &0.loop"));
    // the call from the top level is not in tail position
    assert!(text.contains("call &0.loop\ndisplay"));
}

#[test]
fn make_adder_closes_over_parameter() {
    let program = compile(
        "(define (make-adder n) (lambda (x) (+ x n)))
         (define add5 (make-adder 5))
         (display (add5 10))",
    )
    .unwrap();
    let text = program.to_ail_text();
    assert!(text.contains("loadclosure @&"));
    assert!(text.contains("push @&2\nstore &0.make-adder"));
    assert!(text.contains("store &0.add5"));
}

#[test]
fn every_label_target_exists() {
    let program = compile(
        "(define (classify n)
           (cond ((< n 0) 'negative)
                 ((and (> n 0) (< n 10)) 'small)
                 (else 'large)))
         (display (classify 5))
         (display (call/cc (lambda (k) (k 1))))
         (display ((if #t + -) 1 2))",
    )
    .unwrap();
    let labels = LabelTable::analyse(&program.instructions).unwrap();
    for inst in &program.instructions {
        if let Instruction::Op { argument: Some(aurora_compiler::compiler::ail::Argument::Label(l)), opcode } = inst {
            if *opcode != Opcode::Call && *opcode != Opcode::TailCall && *opcode != Opcode::LoadClosure {
                assert!(labels.get(l).is_some(), "missing label @{}", l);
            }
        }
    }
}

#[test]
fn listing_reparses_to_same_instructions() {
    let program = compile(
        "(define counter 0)
         (define (bump) (set! counter (+ counter 1)) counter)
         (bump) (display (bump)) (newline)",
    )
    .unwrap();
    let reparsed = Program::from_ail_text(&program.to_ail_text()).unwrap();
    assert_eq!(reparsed.instructions, program.instructions);
}

#[test]
fn json_round_trip_keeps_statics() {
    let program = compile("(display '(1 \"two\" (three)))").unwrap();
    let back = read_json(&emit_json(&program).unwrap()).unwrap();
    assert_eq!(back, program);
    assert_eq!(back.statics.values().filter(|o| matches!(o, StaticObject::List(_))).count(), 2);
}

#[test]
fn set_uses_set_opcode() {
    let program = compile("(define x 1) (set! x 2) (display x)").unwrap();
    let ops = ops(&program);
    assert!(ops.contains(&Opcode::Set));
    assert_eq!(ops.iter().filter(|o| **o == Opcode::Store).count(), 1);
}

#[test]
fn fork_statics_are_registered() {
    let program = compile("(fork '(display \"child\"))").unwrap();
    let text = program.to_ail_text();
    let handle = text.lines().find_map(|l| l.strip_prefix("fork ")).unwrap();
    let h = aurora_compiler::compiler::ast::Handle(handle.trim_start_matches('&').parse().unwrap());
    assert_eq!(program.render_static(h).unwrap(), "(display \"child\")");
}

#[test]
fn errors_carry_positions() {
    match compile("(define x 1)\n(set! 5 x)") {
        Err(err @ CompileError::Lower(_)) => assert_eq!(err.location(), Some((2, 1))),
        other => panic!("unexpected result: {:?}", other.map(|p| p.to_ail_text())),
    }
    assert!(matches!(compile("(display \"open"), Err(CompileError::Lex(_))));
    assert!(matches!(compile("(display 1"), Err(CompileError::Parse(_))));
}
