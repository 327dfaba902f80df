/*! Interactive console for querying Saga 1000 meters.

Prompts for the meter address, TCP port and command number, runs the
exchange and prints the decoded reply. Command 0x14 additionally asks
for the reader serial number, which may be given as decimal or
`0x`-prefixed hex.

```text
$ saga1000 -v 2
IP do medidor (ou 'sair' para terminar): 172.16.0.42
Porta TCP do medidor: 5001
Número do comando (exemplo 0x14): 0x14
Número de série do leitor (decimal ou 0x..., vazio = padrão): 0x010203
[…]
```
*/

use std::io::Write;
use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;

use saga1000::CancelToken;
use saga1000::client::{Client, ClientConfig, FieldData, Record, Sink};

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    #[arg(short = 'v', default_value = "0", help = "Log verbosity")]
    verbose: usize,

    #[arg(long, help = "Emit records as JSON lines")]
    json: bool,

    #[arg(long, default_value = "5", help = "Reply timeout in seconds")]
    timeout: u64,
}

struct PrintSink;

impl Sink for PrintSink {
    fn record(&mut self, rec: &Record) {
        println!("Comando {:#04x}:", rec.command);
        if let Some(raw) = &rec.raw {
            println!("  (comando não mapeado) dados: {raw}");
            return;
        }
        for f in &rec.fields {
            match &f.data {
                FieldData::Value(v) => println!("  {:<25} ({}): {v}", f.name, f.kind),
                FieldData::Error(e) => println!("  {:<25} ({}): [erro: {e}]", f.name, f.kind),
                FieldData::Truncated => {
                    println!("  {:<25} ({}): [dados insuficientes]", f.name, f.kind);
                }
            }
        }
    }
}

struct JsonSink;

impl Sink for JsonSink {
    fn record(&mut self, rec: &Record) {
        match serde_json::to_string(rec) {
            Ok(line) => println!("{line}"),
            Err(e) => println!("Erro: {e}"),
        }
    }
}

/// Read one trimmed line, `None` on EOF.
fn prompt(msg: &str) -> Option<String> {
    print!("{msg}");
    std::io::stdout().flush().ok()?;
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).ok()? == 0 {
        return None;
    }
    Some(line.trim().to_string())
}

/// Parse decimal or `0x`-prefixed hex.
fn parse_number(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn main() {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("saga1000")
        .verbosity(opt.verbose)
        .timestamp(stderrlog::Timestamp::Second)
        .init()
        .expect("failed to set up logging");

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!("Interrompido.");
            cancel.cancel();
        })
        .expect("Error setting Ctrl-C handler");
    }

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(ip_str) = prompt("\nIP do medidor (ou 'sair' para terminar): ") else {
            break;
        };
        if ip_str.eq_ignore_ascii_case("sair") {
            break;
        }
        if ip_str.is_empty() {
            continue;
        }
        let ip: IpAddr = match ip_str.parse() {
            Ok(ip) => ip,
            Err(_) => {
                println!("Erro: IP inválido");
                continue;
            }
        };

        let Some(port_str) = prompt("Porta TCP do medidor: ") else {
            break;
        };
        let Ok(port) = port_str.parse::<u16>() else {
            println!("Erro: porta inválida");
            continue;
        };

        let Some(cmd_str) = prompt("Número do comando (exemplo 0x14): ") else {
            break;
        };
        let Some(command) = parse_number(&cmd_str).filter(|c| *c <= 0xFF) else {
            println!("Erro: comando inválido");
            continue;
        };
        let command = command as u8;

        let serial = if command == saga1000::client::CMD_FISCAL_PAGE {
            let Some(s) = prompt("Número de série do leitor (decimal ou 0x..., vazio = padrão): ")
            else {
                break;
            };
            if s.is_empty() {
                None
            } else {
                match parse_number(&s) {
                    Some(v) => Some(v & 0x00FF_FFFF),
                    None => {
                        println!("Erro: número de série inválido");
                        continue;
                    }
                }
            }
        } else {
            None
        };

        let mut cfg = ClientConfig::new(ip, port);
        cfg.link.reply_deadline = Duration::from_secs(opt.timeout);
        let client = Client::new(cfg).with_cancel(cancel.clone());

        let mut print_sink = PrintSink;
        let mut json_sink = JsonSink;
        let sink: &mut dyn Sink = if opt.json {
            &mut json_sink
        } else {
            &mut print_sink
        };

        println!("Executando comando {command:#04x} em {ip}:{port}");
        if let Err(e) = client.run(command, serial, sink) {
            println!("Erro: {e}");
        }
    }
}
