use sapling::{current, spawn, Payload};

fn main() {
    let root = current();
    let adder = spawn(move |p| {
        let mut input: u64 = p.downcast().unwrap();
        loop {
            input = root
                .switch(Payload::new(input + 1))?
                .downcast()
                .unwrap();
        }
    });
    let mut e = 0u64;
    for _ in 1..10 {
        e = adder.switch(Payload::new(e)).unwrap().downcast().unwrap();
    }
    println!("e: {}", e);
}
