use std::env;
use std::fs;

fn main() {
    let mut args = env::args();
    let _exe = args.next();
    let path = args
        .next()
        .expect("usage: message_decode_repro <crash-file>");
    let data = fs::read(path).expect("read input file");

    let Some((&handles, bytes)) = data.split_first() else {
        return;
    };
    let handles = vec![(); usize::from(handles % 4)];

    match shmq_wire::decode(bytes, handles) {
        Ok(message) => {
            println!("decoded {message:?}");
            let (encoded, _) = shmq_wire::encode(message);
            assert_eq!(encoded.as_slice(), bytes, "re-encode differs");
        }
        Err(e) => println!("rejected: {e}"),
    }
}
