use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use vxi11_protocol::codec::{
    build_response, device_read_reply, device_write_args, encode_call, frame_record,
};
use vxi11_protocol::{DeviceCall, Procedure, Transport, VXI11_CORE_PROGRAM, VXI11_CORE_VERSION};

fn encode_replies(c: &mut Criterion) {
    let id = b"IDN-SGLT-PRI SDG0000X";
    c.bench_function("device_read_response", |b| {
        b.iter(|| build_response(black_box(0x1234), &device_read_reply(id), Transport::Tcp))
    });
}

fn decode_writes(c: &mut Criterion) {
    let record = frame_record(&encode_call(
        1,
        VXI11_CORE_PROGRAM,
        VXI11_CORE_VERSION,
        Procedure::DeviceWrite.id(),
        &device_write_args(0, b"C1:BSWV WVTP,SINE,FRQ,1000,AMP,2,OFST,0,PHSE,0"),
    ));
    c.bench_function("device_write_decode", |b| {
        b.iter(|| {
            let call = DeviceCall::parse(black_box(&record)).unwrap();
            call.request().unwrap();
        })
    });
}

criterion_group!(benches, encode_replies, decode_writes);
criterion_main!(benches);
