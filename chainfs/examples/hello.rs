use chainfs::io::FileBlockEmulatorBuilder;
use chainfs::{ElementKind, FileSystem};

pub fn main() {
    let tmp = tempfile::tempfile().unwrap();
    let dev = FileBlockEmulatorBuilder::from(tmp)
        .with_block_count(64)
        .with_block_size(256)
        .build()
        .expect("Could not initialize disk emulator.");

    // create a new chain fs on the device and write into /docs/hello.txt
    let mut fs = FileSystem::create(dev).expect("should create");
    let root = fs.root();
    let docs = fs
        .add_element(root, "docs", ElementKind::Folder)
        .and_then(|e| e.folder())
        .unwrap();
    let file = fs
        .add_element(docs, "hello.txt", ElementKind::File)
        .and_then(|e| e.file())
        .unwrap();
    fs.append(file, b"hello world\n").unwrap();

    let mut buf = vec![0; fs.length(file).unwrap() as usize];
    fs.read(file, 0, &mut buf).unwrap();
    print!("{}", String::from_utf8_lossy(&buf));

    let report = fs.check().unwrap();
    println!("{:?}", report);
    fs.close().unwrap();
}
