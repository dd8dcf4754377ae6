//! Stream frames to a running `spiwired` and print whatever it sends back.
//!
//! Run the daemon:
//!   cargo run --bin spiwired -- --port 6000 --log-level debug
//!
//! Then, in another terminal:
//!   cargo run --example send-frames -- 127.0.0.1:6000 5

use std::io::Read;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use spiwire::frame::FrameWriter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:6000".to_string());
    let count: u32 = match args.next() {
        Some(raw) => raw.parse()?,
        None => 3,
    };

    let stream = TcpStream::connect(&addr)?;
    eprintln!("Connected to {addr}");

    let mut reader = stream.try_clone()?;
    reader.set_read_timeout(Some(Duration::from_millis(500)))?;
    thread::spawn(move || {
        let mut buf = [0u8; 512];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => eprintln!("<- {}", String::from_utf8_lossy(&buf[..n]).trim_end()),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(_) => break,
            }
        }
    });

    let mut writer = FrameWriter::new(stream);
    for tag in 0..count {
        let payload = format!("frame {tag} from send-frames");
        writer.send(tag, payload.as_bytes())?;
        eprintln!("-> tag {tag}, {} bytes", payload.len());
        thread::sleep(Duration::from_millis(200));
    }

    thread::sleep(Duration::from_secs(1));
    Ok(())
}
