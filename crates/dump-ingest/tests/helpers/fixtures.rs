//! Record file fixtures
//!
//! Shapes follow the real dump: quoted values with embedded commas, empty
//! optional cells, and a header line matching the schema.

pub const CUSTOMERS_HEADER: &str = "Index,Customer Id,First Name,Last Name,Company,City,Country,Phone 1,Phone 2,Email,Subscription Date,Website";

pub const ORGANIZATIONS_HEADER: &str =
    "Index,Organization Id,Name,Website,Country,Description,Founded,Industry,Number of employees";

/// Header + 3 customers
pub const CUSTOMERS_CSV: &str = "\
Index,Customer Id,First Name,Last Name,Company,City,Country,Phone 1,Phone 2,Email,Subscription Date,Website
1,DD37Cf93aecA6Dc,Sheryl,Baxter,Rasmussen Group,East Leonard,Chile,229.077.5154,397.884.0519x718,zunigavanessa@smith.info,2020-08-24,http://www.stephenson.com/
2,1Ef7b82A4CAAD10,Preston,Lozano,\"Vega, Holt and Mcgee\",East Jimmychester,Djibouti,5153435776,686-620-1820x944,vmata@colon.com,2021-04-23,http://www.hobbs.com/
3,6F94879bDAfE5a6,Roy,Berry,,Isabelborough,Antigua and Barbuda,+1-539-402-0259,,beckycarr@hogan.com,2020-03-25,http://www.lawrence.com/
";

/// Header + 2 organizations
pub const ORGANIZATIONS_CSV: &str = "\
Index,Organization Id,Name,Website,Country,Description,Founded,Industry,Number of employees
1,FAB0d41d5b5d22c,Ferrell LLC,https://price.net/,Papua New Guinea,Horizontal empowering knowledgebase,1990,Plastics,3498
2,6A7EdDEA9FaDC52,\"Mckinney, Riley and Day\",http://www.hall-buchanan.info/,Finland,User-centric system-worthy leverage,2015,Glass / Ceramics / Concrete,4952
";

/// One well-formed customer line with a unique key
pub fn customer_line(index: usize) -> String {
    format!(
        "{index},CUST{index:06},First{index},Last{index},Company {index},City {index},Chile,555-{index:04},,c{index}@example.com,2021-01-01,http://example.com/{index}"
    )
}

/// Header + one line per entry of `lines`
pub fn customers_csv(lines: &[String]) -> String {
    let mut csv = String::from(CUSTOMERS_HEADER);
    csv.push('\n');
    for line in lines {
        csv.push_str(line);
        csv.push('\n');
    }
    csv
}

/// Header + `count` generated customers
pub fn generated_customers(count: usize) -> String {
    let lines: Vec<String> = (1..=count).map(customer_line).collect();
    customers_csv(&lines)
}
