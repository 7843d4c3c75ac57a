use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use chatroom_reactor::buffer::Buffer;
use chatroom_reactor::codec::http::HttpCodec;
use chatroom_reactor::codec::websocket::{build_frame, Opcode, WebSocketCodec};

const REQUESTS: [(&str, &[u8]); 3] = [
    ("get_no_body", b"GET /users HTTP/1.1\r\nHost: x\r\n\r\n"),
    (
        "post_small_body",
        b"POST /send HTTP/1.1\r\nHost: x\r\nContent-Length: 33\r\n\r\n{\"username\":\"alice\",\"content\":\"hi\"}",
    ),
    (
        "pipelined_three",
        b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\nGET /c HTTP/1.1\r\n\r\n",
    ),
];

fn bench_http_feed(c: &mut Criterion) {
    for (name, raw) in REQUESTS {
        c.bench_with_input(BenchmarkId::new("http_feed", name), black_box(raw), |b, raw| {
            b.iter(|| {
                let mut buf = Buffer::new();
                buf.append(raw);
                let mut codec = HttpCodec::new();
                black_box(codec.feed(&mut buf).unwrap())
            })
        });
    }
}

fn bench_websocket_feed(c: &mut Criterion) {
    let encoded = build_frame(true, Opcode::Text, b"{\"type\":\"message\",\"content\":\"hello there\"}");

    c.bench_function("websocket_feed_single_text_frame", |b| {
        b.iter(|| {
            let mut buf = Buffer::new();
            buf.append(black_box(&encoded));
            let mut codec = WebSocketCodec::new();
            black_box(codec.feed(&mut buf).unwrap())
        })
    });
}

criterion_group!(benches, bench_http_feed, bench_websocket_feed);
criterion_main!(benches);
