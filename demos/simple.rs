use anyhow::Result;
use async_trait::async_trait;

use rust_milter_server::actions::Actions;
use rust_milter_server::handler::{Milter, Properties};
use rust_milter_server::session::{Command, Session};
use rust_milter_server::status::Status;
use rust_milter_server::wire::{SMFIF_ADDHDRS, SMFI_CURRENT_ACTS, SMFI_CURRENT_PROT};

struct TagFilter {
    rcpt_count: usize,
}

#[async_trait]
impl Milter for TagFilter {
    async fn envfrom(&mut self, argv: &[Vec<u8>], _props: &Properties) -> Result<Status> {
        println!("mail from: {}", String::from_utf8_lossy(&argv[0]));
        Ok(Status::Continue)
    }

    async fn envrcpt(&mut self, argv: &[Vec<u8>], _props: &Properties) -> Result<Status> {
        println!("rcpt to: {}", String::from_utf8_lossy(&argv[0]));
        self.rcpt_count += 1;
        Ok(Status::Continue)
    }

    async fn eom(&mut self, actions: &mut Actions, _props: &Properties) -> Result<Status> {
        actions.addheader("X-Filtered", "rust-milter-server")?;
        if self.rcpt_count > 10 {
            return Ok(Status::custom(
                "550",
                Some("5.5.3"),
                &["Too many recipients for my taste"],
            )?);
        }
        Ok(Status::Continue)
    }

    fn action_flags(&self) -> u32 {
        SMFIF_ADDHDRS
    }

    fn reset(&mut self) {
        self.rcpt_count = 0;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut session = Session::new(TagFilter { rcpt_count: 0 });

    // A scripted transaction standing in for the MTA side of the socket.
    let transaction = vec![
        Command::OptNeg {
            version: 6,
            action_flags: SMFI_CURRENT_ACTS,
            protocol_flags: SMFI_CURRENT_PROT,
        },
        Command::Connect {
            hostname: "client.example.org".to_string(),
            hostaddr: Some("192.0.2.7".parse()?),
        },
        Command::Helo {
            helohost: "client.example.org".to_string(),
        },
        Command::Mail {
            argv: vec![b"<alice@example.org>".to_vec()],
        },
        Command::Rcpt {
            argv: vec![b"<bob@example.net>".to_vec()],
        },
        Command::Header {
            name: b"Subject".to_vec(),
            value: b"hello".to_vec(),
        },
        Command::Eoh,
        Command::Body {
            chunk: b"hi bob\r\n".to_vec(),
        },
        Command::BodyEob,
        Command::Quit,
    ];

    for cmd in transaction {
        for packet in session.process(cmd).await? {
            println!("-> {:?} {:?}", packet.code as char, packet.payload);
        }
    }

    Ok(())
}
