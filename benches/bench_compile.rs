use criterion::{Criterion, black_box, criterion_group, criterion_main};
use sbtextc::codegen::generate_project_json;
use sbtextc::parser::parse_source;
use sbtextc::semantic::analyze;
use std::fmt::Write;
use std::path::Path;

/// Generate a realistic multi-sprite project exercising every pipeline
/// stage: declarations, procedures, nested control flow, list operations,
/// and broadcasts.
fn make_project_source(sprites: usize) -> String {
    let mut src = String::from("stage\nwhen flag clicked\nbroadcast [start]\nend\nend\n");
    for i in 0..sprites {
        write!(
            src,
            "sprite Actor{i}\n\
             var hp\nvar score\nlist moves\n\
             define attack (power)\n\
             change [hp] by (-(power))\n\
             add (power) to [moves]\n\
             end\n\
             when I receive [start]\n\
             set [hp] to (100)\nset [score] to (0)\n\
             go to x ({i}) y (0)\n\
             repeat (10)\n\
             move (pick random (1) to (10)) steps\n\
             if <(hp) > (50) and (score) <= (100)> then\n\
             attack (item (1) of [moves])\n\
             change [score] by (1)\n\
             else\n\
             broadcast [retreat{i}]\n\
             end\n\
             end\n\
             end\n\
             end\n"
        )
        .expect("writing to a String cannot fail");
    }
    src
}

fn bench_parse(c: &mut Criterion) {
    let source = make_project_source(20);
    c.bench_function("parse_20_sprites", |b| {
        b.iter(|| parse_source(black_box(&source)).unwrap())
    });
}

fn bench_full_pipeline(c: &mut Criterion) {
    let source = make_project_source(20);
    c.bench_function("compile_20_sprites_to_json", |b| {
        b.iter(|| {
            let project = parse_source(black_box(&source)).unwrap();
            analyze(&project).unwrap();
            generate_project_json(&project, Path::new("."), true).unwrap()
        })
    });
}

criterion_group!(benches, bench_parse, bench_full_pipeline);
criterion_main!(benches);
