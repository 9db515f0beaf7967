use divan::AllocProfiler;
use poe_ggpk::write::{GgpkWriter, GgpkWriterOptions};
use std::io::{Cursor, Write};

#[global_allocator]
static ALLOC: AllocProfiler = AllocProfiler::system();

fn main() {
    divan::main();
}

/// Builds a container with 256 files of 4 KiB spread over eight directories.
fn build_container() -> Vec<u8> {
    let mut writer = GgpkWriter::new(
        Cursor::new(Vec::new()),
        GgpkWriterOptions::builder().build(),
    );

    let payload = vec![0x5A; 4096];
    for i in 0..256 {
        writer
            .start_file(&format!("data/dir_{:02}/file_{:03}.bin", i % 8, i))
            .unwrap();
        writer.write_all(&payload).unwrap();
    }

    writer.finish().unwrap().into_inner()
}

pub mod read {
    use divan::Bencher;
    use poe_ggpk::read::{GgpkArchive, GgpkArchiveOptions, Verification};
    use std::io::{prelude::*, Cursor};

    use super::build_container;

    #[divan::bench]
    fn open(bencher: Bencher) {
        bencher.with_inputs(build_container).bench_refs(|data| {
            divan::black_box(GgpkArchive::new(Cursor::new(data)).unwrap());
        });
    }

    #[divan::bench]
    fn resolve_path(bencher: Bencher) {
        bencher
            .with_inputs(|| GgpkArchive::new(Cursor::new(build_container())).unwrap())
            .bench_refs(|ggpk| {
                divan::black_box(ggpk.resolve_file("data/dir_03/file_123.bin").unwrap());
            });
    }

    #[divan::bench(sample_count = 1)]
    fn read_file_first(bencher: Bencher) {
        let mut ggpk = GgpkArchive::new(Cursor::new(build_container())).unwrap();
        bencher.bench_local(move || {
            let mut buffer = Vec::new();

            let mut file = ggpk.by_path("data/dir_00/file_000.bin").unwrap();
            file.read_to_end(&mut buffer).unwrap();
        });
    }

    #[divan::bench(sample_count = 1)]
    fn read_file_all(bencher: Bencher) {
        let mut ggpk = GgpkArchive::with_options(
            Cursor::new(build_container()),
            GgpkArchiveOptions::builder()
                .verification(Verification::Off)
                .build(),
        )
        .unwrap();

        let mut paths = Vec::new();
        ggpk.root_dir().walk(&mut |path, node| {
            if node.as_file().is_some() {
                paths.push(path.to_owned());
            }
        });

        bencher.bench_local(move || {
            let mut buffer = Vec::new();
            for path in &paths {
                let mut file = ggpk.by_path(path).unwrap();
                file.read_to_end(&mut buffer).unwrap();
                buffer.clear();
            }
        });
    }

    #[divan::bench(sample_count = 1)]
    fn verify_all(bencher: Bencher) {
        let mut ggpk = GgpkArchive::new(Cursor::new(build_container())).unwrap();

        let mut paths = Vec::new();
        ggpk.root_dir().walk(&mut |path, node| {
            if node.as_file().is_some() {
                paths.push(path.to_owned());
            }
        });

        bencher.bench_local(move || {
            for path in &paths {
                ggpk.verify_path(path).unwrap();
            }
        });
    }
}

pub mod write {
    use divan::Bencher;
    use poe_ggpk::read::GgpkArchive;
    use std::io::Cursor;

    use super::build_container;

    #[divan::bench(sample_count = 10)]
    fn pack() -> Vec<u8> {
        build_container()
    }

    #[divan::bench(sample_count = 1)]
    fn insert(bencher: Bencher) {
        let mut ggpk = GgpkArchive::new(Cursor::new(build_container())).unwrap();
        let mut serial = 0u32;
        bencher.bench_local(move || {
            serial += 1;
            ggpk.insert_file(&format!("data/dir_08/file_{:05}.bin", serial), b"fresh")
                .unwrap();
        });
    }
}
