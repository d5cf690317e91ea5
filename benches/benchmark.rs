use criterion::{criterion_group, criterion_main, Criterion};
use bitpack::env::Environment;
use bitpack::hash::{HashGenerator, Key};
use bitpack::obj::BitObjType;
use bitpack::odb::ObjectDb;
use std::io::Write;
use std::path::Path;

const PACK_IDX_MAGIC: u32 = 0xff744f63;

fn zlib_compress(bytes: &[u8]) -> Vec<u8> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

fn encode_type_size(obj_type: u8, mut size: usize) -> Vec<u8> {
    let mut out = vec![(obj_type << 4) | (size as u8 & 0x0f) | if size >= 16 { 0x80 } else { 0 }];
    size >>= 4;
    while size != 0 {
        let mut byte = (size & 0x7f) as u8;
        size >>= 7;
        if size != 0 {
            byte |= 0x80;
        }
        out.push(byte);
    }
    out
}

fn encode_ofs_delta_offset(mut value: u64) -> Vec<u8> {
    let mut bytes = vec![(value & 0x7f) as u8];
    value >>= 7;
    while value != 0 {
        value -= 1;
        bytes.push((0x80 | (value & 0x7f)) as u8);
        value >>= 7;
    }
    bytes.reverse();
    bytes
}

fn encode_size_varint(mut n: usize) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (n & 0x7f) as u8;
        n >>= 7;
        if n != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if n == 0 {
            break;
        }
    }
    out
}

/// a trivial single-copy delta: copy the whole base, then append whatever
/// tail makes up the length difference with `target`.
fn build_copy_delta(base: &[u8], target: &[u8]) -> Vec<u8> {
    let mut delta = Vec::new();
    delta.extend_from_slice(&encode_size_varint(base.len()));
    delta.extend_from_slice(&encode_size_varint(target.len()));
    let copy_len = base.len().min(target.len()).min(0xffffff);
    delta.push(0x91);
    delta.push(0);
    delta.push(0);
    delta.push((copy_len & 0xff) as u8);
    if target.len() > copy_len {
        let tail = &target[copy_len..];
        delta.push(tail.len() as u8);
        delta.extend_from_slice(tail);
    }
    delta
}

/// writes a single pack containing `n` blobs of `blob_size` bytes, the
/// first stored whole and every following one as an `ofs_delta` against
/// its immediate predecessor, so resolving the last entry walks the
/// entire chain.
fn write_chain_pack(dir: &Path, n: usize, blob_size: usize) -> Vec<Key> {
    let mut keys = Vec::with_capacity(n);
    let mut offsets = Vec::with_capacity(n);
    let mut pack = Vec::new();
    pack.extend_from_slice(bitpack::pack::PACK_SIGNATURE);
    pack.extend_from_slice(&2u32.to_be_bytes());
    pack.extend_from_slice(&(n as u32).to_be_bytes());

    let mut prev_content: Option<Vec<u8>> = None;
    for i in 0..n {
        let content: Vec<u8> = (0..blob_size).map(|b| ((b + i) % 251) as u8).collect();
        let mut gen = HashGenerator::new();
        gen.update(format!("blob {}\0", content.len()));
        gen.update(&content);
        keys.push(gen.finalize());

        offsets.push(pack.len() as u32);
        match &prev_content {
            None => {
                pack.append(&mut encode_type_size(3, content.len()));
                pack.extend_from_slice(&zlib_compress(&content));
            }
            Some(base) => {
                let delta = build_copy_delta(base, &content);
                let base_offset_back = (pack.len() - *offsets.get(i - 1).unwrap() as usize) as u64;
                pack.append(&mut encode_type_size(6, delta.len()));
                pack.extend_from_slice(&encode_ofs_delta_offset(base_offset_back));
                pack.extend_from_slice(&zlib_compress(&delta));
            }
        }
        prev_content = Some(content);
    }

    let mut pack_hasher = HashGenerator::new();
    pack_hasher.update(&pack);
    let checksum = pack_hasher.finalize();
    pack.extend_from_slice(checksum.as_bytes());

    let mut entries: Vec<(Key, u32)> = keys.iter().cloned().zip(offsets.iter().cloned()).collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut fanout = [0u32; 256];
    for (key, _) in &entries {
        for b in key.as_bytes()[0] as usize..256 {
            fanout[b] += 1;
        }
    }
    let mut idx = Vec::new();
    idx.extend_from_slice(&PACK_IDX_MAGIC.to_be_bytes());
    idx.extend_from_slice(&2u32.to_be_bytes());
    for f in fanout {
        idx.extend_from_slice(&f.to_be_bytes());
    }
    for (key, _) in &entries {
        idx.extend_from_slice(key.as_bytes());
    }
    for _ in &entries {
        idx.extend_from_slice(&0u32.to_be_bytes());
    }
    for (_, offset) in &entries {
        idx.extend_from_slice(&offset.to_be_bytes());
    }
    idx.extend_from_slice(checksum.as_bytes());
    let mut idx_hasher = HashGenerator::new();
    idx_hasher.update(&idx);
    idx.extend_from_slice(idx_hasher.finalize().as_bytes());

    let pack_dir = dir.join("pack");
    std::fs::create_dir_all(&pack_dir).unwrap();
    std::fs::write(pack_dir.join("pack-bench.pack"), &pack).unwrap();
    std::fs::write(pack_dir.join("pack-bench.idx"), &idx).unwrap();
    keys
}

fn bench_resolve_delta_chain(c: &mut Criterion) {
    let _ = env_logger::builder().parse_env("BIT_LOG").try_init();
    let dir = tempfile::tempdir().unwrap();
    let keys = write_chain_pack(dir.path(), 64, 4096);
    let mut db = ObjectDb::new(dir.path(), Environment::for_tests());
    db.refresh_packs().unwrap();
    let last = *keys.last().unwrap();

    c.bench_function("resolve_delta_chain", |b| b.iter(|| db.get_raw(&last).unwrap()));
}

fn bench_loose_write_then_read(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut db = ObjectDb::new(dir.path(), Environment::for_tests());
    let content = vec![7u8; 8192];

    c.bench_function("loose_write_then_read", |b| {
        b.iter(|| {
            let key = db.put_loose(BitObjType::Blob, &content).unwrap();
            db.get_raw(&key).unwrap()
        })
    });
}

criterion_group!(benches, bench_resolve_delta_chain, bench_loose_write_then_read);
criterion_main!(benches);
