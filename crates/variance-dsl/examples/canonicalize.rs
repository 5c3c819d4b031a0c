use variance_dsl::parse_expression;
use variance_expr_ast::{expression_hash, extract_dependencies};

fn main() {
    let inputs: Vec<String> = std::env::args().skip(1).collect();
    let inputs = if inputs.is_empty() {
        vec!["topping = salami AND (base = tomato ketchup OR base = sauce hollandaise)".to_string()]
    } else {
        inputs
    };

    for input in &inputs {
        match parse_expression(input) {
            Ok(expr) => {
                let deps = extract_dependencies(&expr);
                let mut families: Vec<_> = deps.families.into_iter().collect();
                families.sort();
                println!("canonical={}", expr);
                println!("hash={}", expression_hash(&expr));
                println!("families={:?}", families);
            }
            Err(e) => eprintln!("{:?}: {}", input, e),
        }
    }
}
