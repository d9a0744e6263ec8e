use criterion::{criterion_group, criterion_main, Criterion};
use rfbtv_core::protocol::messages::ProtocolVersion;
use rfbtv_core::{RfbtvCodec, WireBuffer};

use std::collections::BTreeMap;

fn bench_session_setup_encode(c: &mut Criterion) {
    let mut codec = RfbtvCodec::new();
    codec.set_version(ProtocolVersion::V2_0);

    let mut params = BTreeMap::new();
    params.insert("url".to_string(), "webkit:http://app.example/tv".to_string());
    params.insert("profile".to_string(), "hd".to_string());

    c.bench_function("encode_session_setup", |b| {
        b.iter(|| {
            let msg = codec.create_session_setup("acme-tv_abc123", &params, "S1", "C1");
            assert!(!msg.is_empty());
        })
    });
}

fn bench_framebuffer_update_parse(c: &mut Criterion) {
    let mut codec = RfbtvCodec::new();
    codec.set_version(ProtocolVersion::V2_0);

    // One picture-object rectangle with a 16 KiB blob
    let mut template = WireBuffer::new();
    template.write_u8(0);
    template.write_u8(0x3);
    template.write_u16(1);
    template.write_u16(0);
    template.write_u16(0);
    template.write_u16(1280);
    template.write_u16(720);
    template.write_u32(42);
    template.write_u8(255);
    template.write_blob(&vec![0x5A; 16 * 1024]);
    let bytes = template.data().to_vec();

    c.bench_function("parse_framebuffer_update_16k", |b| {
        b.iter(|| {
            let mut msg = WireBuffer::new();
            msg.write_raw(&bytes);
            codec.parse_message(&mut msg).expect("parse");
        })
    });
}

criterion_group!(benches, bench_session_setup_encode, bench_framebuffer_update_parse);
criterion_main!(benches);
