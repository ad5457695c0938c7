use bytes::Bytes;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use maku::strutil::{Pattern, word_scanner};

fn criterion_benchmark(c: &mut Criterion) {
    let word = "frameworks/base/docs/html/tv/adt-1/index.jd ";
    let s = word.repeat(400000 / word.len());

    c.bench_function("wordscanner", |b| {
        b.iter(|| black_box(word_scanner(black_box(s.as_bytes())).collect::<Vec<&[u8]>>()))
    });

    let pat = Pattern::new(Bytes::from_static(b"%.jd"));
    c.bench_function("pattern_subst", |b| {
        b.iter(|| {
            let mut n = 0usize;
            for tok in word_scanner(black_box(s.as_bytes())) {
                let tok = Bytes::copy_from_slice(tok);
                n += pat.append_subst(&tok, &Bytes::from_static(b"%.html")).len();
            }
            black_box(n)
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
