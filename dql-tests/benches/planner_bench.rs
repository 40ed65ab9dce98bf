/// Performance benchmarks for parsing, planning and in-memory execution
///
/// Run with: cargo bench -p dql-tests

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dql_core::expression::translate;
use dql_core::lang::DqlParser;
use dql_core::planner::{Planner, PlannerOptions};
use dql_test_utils::{forum_engine, forum_table, post, MemoryStore};

const STATEMENTS: [&str; 4] = [
    "SELECT * FROM forum WHERE id = 'a'",
    "SELECT title FROM forum WHERE author = 'bob' AND ts > 3 DESC LIMIT 10",
    "SELECT * FROM forum WHERE id = 'a' AND score BETWEEN 1 AND 5 AND (title BEGINS WITH 'x' OR size(tags) > 2)",
    "UPDATE forum SET score = score + 1, seen = if_not_exists(seen, 0) REMOVE draft WHERE id = 'a' RETURNS ALL NEW",
];

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    for (i, text) in STATEMENTS.iter().enumerate() {
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::new("statement", i), text, |b, text| {
            b.iter(|| DqlParser::parse_statement(black_box(text)).unwrap());
        });
    }
    group.finish();
}

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan");
    let meta = forum_table();
    for (i, text) in STATEMENTS.iter().enumerate() {
        let statement = DqlParser::parse_statement(text).unwrap();
        group.bench_with_input(BenchmarkId::new("statement", i), &statement, |b, statement| {
            b.iter(|| {
                Planner::new(&meta, PlannerOptions::default())
                    .plan(black_box(statement))
                    .unwrap()
            });
        });
    }
    group.finish();
}

fn bench_translate(c: &mut Criterion) {
    let pred = DqlParser::parse_condition(
        "a = 1 AND b BETWEEN 'x' AND 'z' AND (c IN (1, 2, 3) OR begins_with(d.e[0], 'p')) AND NOT f = a",
    )
    .unwrap();
    c.bench_function("translate", |b| b.iter(|| translate(black_box(&pred)).unwrap()));
}

fn bench_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");

    for rows in [100, 1000] {
        group.throughput(Throughput::Elements(rows));
        group.bench_with_input(BenchmarkId::new("query", rows), &rows, |b, &rows| {
            let engine = forum_engine();
            engine
                .store()
                .seed("forum", (0..rows as i64).map(|ts| post("bench", ts, "alice", ts % 10)));
            b.iter(|| {
                engine
                    .execute(black_box("SELECT * FROM forum WHERE id = 'bench' AND score > 4"))
                    .unwrap()
            });
        });
    }

    group.bench_function("insert_batch", |b| {
        let engine = dql_test_utils::engine_with(
            MemoryStore::new().with_table(forum_table()),
            dql_test_utils::fast_config(),
        );
        let items: Vec<_> = (0..100).map(|ts| post("batch", ts, "bob", 1)).collect();
        b.iter(|| engine.load_items("forum", black_box(items.clone()), None).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_parse, bench_plan, bench_translate, bench_execute);
criterion_main!(benches);
