use nom::IResult;

/// An unsolicited result line from the modem, after trimming.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Response<'a> {
    Ring,
    NoCarrier,
    Connect { rate: Option<u32> },
    Other(&'a str),
}

pub fn classify(line: &str) -> Response<'_> {
    let line = line.trim();
    match response(line) {
        Ok((_, response)) => response,
        Err(_) => Response::Other(line),
    }
}

fn response(line: &str) -> IResult<&str, Response> {
    nom::branch::alt((
        nom::combinator::value(Response::Ring, nom::combinator::all_consuming(nom::bytes::complete::tag("RING"))),
        nom::combinator::value(Response::NoCarrier, nom::combinator::all_consuming(nom::bytes::complete::tag("NO CARRIER"))),
        nom::combinator::map(connect, |rate| Response::Connect { rate }),
    ))(line)
}

/// Any line mentioning `CONNECT`, with the rate that usually follows it.
fn connect(line: &str) -> IResult<&str, Option<u32>> {
    let (rest, _) = nom::bytes::complete::take_until("CONNECT")(line)?;
    let (rest, _) = nom::bytes::complete::tag("CONNECT")(rest)?;
    nom::combinator::opt(nom::sequence::preceded(
        nom::character::complete::space1,
        nom::character::complete::u32,
    ))(rest)
}
