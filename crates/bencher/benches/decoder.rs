use std::hint::black_box;

use bencher::{TestCase, TestFile};
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use micro_transport::codec::RequestDecoder;
use micro_transport::protocol::{Message, PayloadItem};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

static SMALL_GET: TestFile = TestFile::new("get_small.txt", include_str!("../resources/request/get_small.txt"));
static LARGE_POST: TestFile = TestFile::new("post_large.txt", include_str!("../resources/request/post_large.txt"));

fn create_test_cases() -> Vec<TestCase> {
    vec![TestCase::new("small_get", SMALL_GET), TestCase::new("large_post", LARGE_POST)]
}

fn benchmark_request_decoder(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("request_decoder");

    for case in create_test_cases() {
        group.throughput(Throughput::Bytes(case.file().content().len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(case.name()), &case, |b, case| {
            let mut request_decoder = RequestDecoder::new();
            b.iter_batched_ref(
                || BytesMut::from(case.file().content()),
                |bytes_mut| {
                    // the head, then payload items up to the end of the body
                    while let Some(message) = request_decoder.decode(bytes_mut).expect("input should be a valid http request") {
                        let eof = matches!(message, Message::Payload(PayloadItem::Eof));
                        black_box(message);
                        if eof {
                            break;
                        }
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(decoder, benchmark_request_decoder);
criterion_main!(decoder);
